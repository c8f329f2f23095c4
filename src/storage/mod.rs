mod notifications;
mod schema;
mod types;

pub use schema::Database;
pub use types::DatabaseError;
pub(crate) use types::now_millis;
