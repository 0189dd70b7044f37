pub mod sqlite;
pub mod walks;

pub use sqlite::{Database, SqliteGraphStore};
pub use walks::SqliteWalkStore;
