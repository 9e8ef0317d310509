//! Best-effort replication of writes to the other instances
//!
//! Writes are never applied to other instances directly. Each replicated
//! operation becomes one [`ReplicationEnvelope`] handed to an external
//! [`ReplicationChannel`], which re-applies it out of band.

pub mod channel;
pub mod dispatcher;
pub mod envelope;

pub use channel::{ChannelError, GithubDispatchChannel, LogChannel, ReplicationChannel};
pub use dispatcher::ReplicationDispatcher;
pub use envelope::{ReplicationEnvelope, ReplicationPayload};
