//! listmill Storage - Postgres persistence for the campaign engine
//!
//! This crate provides the database pool, the data models, the `Store`
//! contract the engine runs against, and the repository implementations
//! holding the SQL.

pub mod db;
pub mod models;
pub mod repository;
pub mod store;

pub use db::DatabasePool;
pub use store::{PgStore, Store, StoreError, StoreResult};
