//! Durable storage for batches, runs and outputs.
//!
//! # Overview
//!
//! - **BatchStore**: the trait the processor talks to
//! - **PgBatchStore**: PostgreSQL implementation with status-guarded updates
//! - **InMemoryBatchStore**: in-process implementation backing the tests
//! - **Migrations**: schema management and versioning
//!
//! # Usage
//!
//! ```rust,ignore
//! use repose_forge::storage::{BatchStore, PgBatchStore};
//!
//! let store = PgBatchStore::connect("postgres://localhost/repose").await?;
//! store.run_migrations().await?;
//!
//! let counts = store.count_batch_outputs(batch_id).await?;
//! println!("{} of {} outputs done", counts.terminal(), counts.total());
//! ```

pub mod database;
pub mod memory;
pub mod migrations;
pub mod schema;
pub mod store;

pub use database::PgBatchStore;
pub use memory::InMemoryBatchStore;
pub use migrations::{MigrationError, MigrationRunner};
pub use store::{BatchStore, StoreError};
