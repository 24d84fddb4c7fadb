pub mod error;
pub mod ids;
pub mod operations;
pub mod seq;
pub mod value;

pub use error::CoreError;
pub use ids::*;
pub use operations::{Category, ColumnDef, Operation, OperationKind, OperationPayload};
pub use seq::{Seq, SeqClock};
pub use value::Value;
