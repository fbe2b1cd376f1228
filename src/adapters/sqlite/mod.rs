//! SQLite persistence adapters.

pub mod connection;
pub mod migrations;
pub mod store;
pub mod util;

pub use connection::{create_pool, create_test_pool, verify_connection, PoolConfig};
pub use migrations::{all_embedded_migrations, Migration, Migrator};
pub use store::Store;
