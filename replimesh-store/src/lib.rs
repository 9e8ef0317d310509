//! replimesh-store: executes operations against a fleet of document-database
//! instances and replicates writes between them
//!
//! ```text
//! MeshClient ─► InstanceSelector ─► OperationExecutor ─► ConnectionRegistry ─► DocumentDriver
//!                                        │
//!                                        └─► ReplicationDispatcher ─► ReplicationChannel
//! ```

pub mod client;
pub mod driver;
pub mod engine;
pub mod executor;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod registry;
pub mod replication;
pub mod transaction;

pub use client::{CollectionHandle, MeshClient, MeshClientBuilder, ReadTarget};
pub use driver::{DatabaseExt, DatabaseHandle, DocumentDriver, DriverClient, DriverSession};
pub use executor::OperationExecutor;
pub use memory::MemoryDriver;
#[cfg(feature = "postgres")]
pub use postgres::PgDocumentDriver;
pub use registry::ConnectionRegistry;
pub use replication::{
    ChannelError, GithubDispatchChannel, LogChannel, ReplicationChannel, ReplicationDispatcher,
    ReplicationEnvelope,
};
pub use transaction::{TransactionCoordinator, TransactionDb, TransactionState};
