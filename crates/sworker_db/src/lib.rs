//! Async SQLite access for the worker script store.
//!
//! All statements run on a single connection owned by a background thread
//! (see [`DbConnection`]). Callers get an async API, transactions scoped to a
//! closure, and incremental BLOB writes for values too large to buffer.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sworker_db::{DbConnection, DbValue};
//!
//! let conn = DbConnection::open_sqlite(path).await?;
//! conn.execute("DELETE FROM workers WHERE worker_id = ?", &[DbValue::from(id)]).await?;
//! ```

mod connection;
mod error;
mod value;

pub use connection::{BlobCell, DbConnection, DbTransaction};
pub use error::{BackendError, Result};
pub use value::{DbRow, DbValue, FromDbValue};
