pub mod conversations;
pub mod documents;
pub mod kb;
pub mod sqlite;

pub use sqlite::{init_sqlite_db, DbError, SqlDb};
