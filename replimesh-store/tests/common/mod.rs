//! Shared fixtures: a three-instance mesh over the memory driver and a
//! replication channel that records envelopes on an mpsc queue.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use replimesh_core::MeshConfig;
use replimesh_store::{
    ChannelError, MemoryDriver, MeshClient, ReplicationChannel, ReplicationEnvelope,
};

pub const DATABASE: &str = "siasis_asuncion_8";

pub struct RecordingChannel {
    tx: mpsc::UnboundedSender<ReplicationEnvelope>,
}

#[async_trait]
impl ReplicationChannel for RecordingChannel {
    async fn deliver(&self, envelope: &ReplicationEnvelope) -> Result<(), ChannelError> {
        self.tx
            .send(envelope.clone())
            .map_err(|e| ChannelError::Transport {
                reason: e.to_string(),
            })
    }
}

pub fn recording_channel() -> (
    Arc<RecordingChannel>,
    mpsc::UnboundedReceiver<ReplicationEnvelope>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingChannel { tx }), rx)
}

/// Wait for the next envelope from a detached dispatch
pub async fn next_envelope(rx: &mut mpsc::UnboundedReceiver<ReplicationEnvelope>) -> ReplicationEnvelope {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for replication envelope")
        .expect("replication channel closed")
}

/// Assert nothing arrives within a short window
pub async fn assert_no_envelope(rx: &mut mpsc::UnboundedReceiver<ReplicationEnvelope>) {
    if let Ok(Some(envelope)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        panic!("unexpected replication envelope: {:?}", envelope);
    }
}

/// A, B, C; guardian -> {A, B}; administrative staff -> {A, C}; tutor -> {A}
pub fn config() -> MeshConfig {
    let mut config = MeshConfig::default();
    for (id, url) in [("A", "memory://a"), ("B", "memory://b"), ("C", "memory://c")] {
        config.instances.insert(id.to_string(), url.to_string());
    }
    config
        .roles
        .insert("guardian".to_string(), vec!["A".to_string(), "B".to_string()]);
    config.roles.insert(
        "administrative_staff".to_string(),
        vec!["A".to_string(), "C".to_string()],
    );
    config.roles.insert("tutor".to_string(), vec!["A".to_string()]);
    config
}

pub struct Fixture {
    pub driver: Arc<MemoryDriver>,
    pub mesh: MeshClient,
    pub envelopes: mpsc::UnboundedReceiver<ReplicationEnvelope>,
}

pub fn fixture() -> Fixture {
    fixture_with(config())
}

/// Route library logs to the test harness; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fixture_with(config: MeshConfig) -> Fixture {
    init_tracing();
    let driver = Arc::new(MemoryDriver::new());
    let (channel, envelopes) = recording_channel();
    let mesh = MeshClient::builder(config)
        .driver(driver.clone())
        .channel(channel)
        .seed(42)
        .build()
        .expect("fixture config is valid");
    Fixture {
        driver,
        mesh,
        envelopes,
    }
}

pub fn doc(value: serde_json::Value) -> replimesh_core::Document {
    value.as_object().cloned().expect("object literal")
}
