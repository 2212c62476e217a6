//! # Database Operations
//!
//! PostgreSQL implementations of the execution and restraint stores, plus
//! pool construction and the embedded migrator.
//!
//! - [`connection`] - pool construction from [`DatabaseConfig`](crate::config::DatabaseConfig)
//! - [`migrator`] - embedded `migrations/` directory
//! - [`execution_store`] - nodes and continuations
//! - [`restraint_store`] - consumer ledger and unit leases
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use steprunner_core::config::DatabaseConfig;
//! use steprunner_core::database::{migrator, DatabaseConnection, PgExecutionStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = DatabaseConnection::connect(&DatabaseConfig::default()).await?;
//! migrator::run_migrations(db.pool()).await?;
//! let store = PgExecutionStore::new(db.pool().clone());
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod execution_store;
pub mod migrator;
pub mod restraint_store;

pub use connection::DatabaseConnection;
pub use execution_store::PgExecutionStore;
pub use restraint_store::PgRestraintStore;
