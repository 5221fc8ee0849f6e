//! # sqlpool-client
//!
//! The physical-connection abstraction consumed by the `sqlpool` pool.
//!
//! Driver crates implement [`PhysicalConnection`], [`PreparedStatement`],
//! and [`ConnectionFactory`] to plug a database into the pool. The traits
//! model a raw, one-connection-at-a-time client: connect, prepare, close.
//! Everything above that — multiplexing, reuse limits, statement caching,
//! abandonment reaping — lives in the pool crate.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlpool_client::{ConnectionFactory, PhysicalConnection, ClientError};
//! use std::sync::Arc;
//!
//! struct MyFactory { url: String }
//!
//! #[async_trait::async_trait]
//! impl ConnectionFactory for MyFactory {
//!     async fn connect(&self) -> Result<Arc<dyn PhysicalConnection>, ClientError> {
//!         let conn = my_driver::connect(&self.url)
//!             .await
//!             .map_err(|e| ClientError::Connect(e.to_string()))?;
//!         Ok(Arc::new(conn))
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod error;
pub mod statement;
pub mod value;

pub use connection::{ConnectionFactory, PhysicalConnection, same_connection};
pub use error::ClientError;
pub use statement::{PreparedStatement, StatementKind, StatementSpec};
pub use value::SqlValue;
