//! Persistence layer: connection pooling, migrations, and typed query
//! functions backing the `StateStore` port.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
