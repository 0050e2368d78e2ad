pub mod log_manager;
pub mod record;
pub mod recovery;

pub use log_manager::LogManager;
pub use record::{CheckpointBody, LogRecord, PageImage, RecordKind, RowChange, StructuralKind, StructuralOp, StructuralPayload};

/// Log sequence number. Monotonic, assigned at append, never reused.
pub type Lsn = u64;

/// Transaction identifier. Monotonic; larger means younger.
pub type TxnId = u64;

pub const NO_LSN: Lsn = 0;
