pub mod aggregate;
pub mod dml;
pub mod expr;
pub mod join;
pub mod misc;
pub mod operator;
pub mod parallel;
pub mod result;
pub mod scan;
pub mod set_op;
pub mod sort;

pub use operator::{ExecContext, Operator};
pub use result::QueryResult;

use crate::{error::GraniteError, storage::Row, types::GraniteResult};

/// Run a built operator tree to completion: open, drain, close.
/// Close runs even when the drain fails, so latches and temp files
/// never leak on error paths.
pub fn run_to_completion(
    operator: &mut Operator,
    ctx: &ExecContext,
) -> Result<(Vec<Row>, Option<u64>), GraniteError> {
    operator.open(ctx)?;

    let drained: Result<Vec<Row>, GraniteError> = (|| {
        let mut rows = Vec::new();
        while let Some(row) = operator.next(ctx)? {
            rows.push(row);
        }
        Ok(rows)
    })();

    let close_result: GraniteResult = operator.close(ctx);

    let rows = drained?;
    close_result?;
    Ok((rows, operator.rows_affected()))
}
