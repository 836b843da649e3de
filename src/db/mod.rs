//! Persistence layer: connection pool, schema, and typed repository
//! functions over sqlite.

pub mod models;
mod pool;
mod repository;

pub use models::*;
pub use pool::open;
pub use repository::*;
