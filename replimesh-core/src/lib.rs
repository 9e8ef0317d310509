//! replimesh-core: routing model for a fleet of document-database instances
//!
//! Holds everything that does not touch the network: roles, the instance
//! directory, the read/write selection policy, operation descriptors and the
//! document evaluator the drivers share.

pub mod config;
pub mod directory;
pub mod document;
pub mod error;
pub mod instance;
pub mod operation;
pub mod outcome;
pub mod pipeline;
pub mod role;
pub mod selector;

pub use config::{MeshConfig, PoolConfig, ReplicationConfig};
pub use directory::{DirectoryBuilder, InstanceDirectory};
pub use document::Document;
pub use error::{DriverError, MeshError, Result};
pub use instance::{redact_url, InstanceId};
pub use operation::{Operation, OperationKind};
pub use outcome::{DeleteResult, InsertManyResult, InsertOneResult, OperationResult, UpdateResult};
pub use role::Role;
pub use selector::InstanceSelector;
