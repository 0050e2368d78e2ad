pub mod cell;
pub mod schema;
pub mod tuple;

pub use cell::{Cell, Type};
pub use schema::{Column, ForeignKey, ReferentialAction, Schema};
pub use tuple::{KeyComparator, NullOrder, Rid, Row};
