//! `PostgreSQL` collaborators for meshbus.
//!
//! - [`PgLockStore`]: lease-based distributed locks in a single table, for
//!   the runtime's `LeaseManager`.
//! - [`PgUnitOfWork`]: an sqlx transaction with post-commit hooks, for the
//!   transactional outbox.
//!
//! # Example
//!
//! ```no_run
//! use meshbus_core::UnitOfWork;
//! use meshbus_postgres::{PgLockStore, PgUnitOfWork};
//!
//! # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let locks = PgLockStore::new(pool.clone());
//! locks.ensure_schema().await?;
//!
//! let uow = PgUnitOfWork::begin(&pool).await?;
//! {
//!     let mut tx = uow.transaction().await?;
//!     sqlx::query("INSERT INTO orders (id) VALUES ($1)")
//!         .bind(42_i64)
//!         .execute(&mut **tx)
//!         .await?;
//! }
//! uow.commit().await?;
//! # Ok(())
//! # }
//! ```

mod lock_store;
mod unit_of_work;

pub use lock_store::{LeaseRecord, PgLockStore};
pub use unit_of_work::PgUnitOfWork;
