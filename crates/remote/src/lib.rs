pub mod error;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use error::RemoteError;
pub use sqlite::{CommitMode, SqliteEndpoint};
pub use traits::*;
