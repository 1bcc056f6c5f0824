#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use solar_dongle::{MqttBridge, Result, Revertible};

/// In-memory MQTT collaborator that records every operation in order.
#[derive(Default)]
pub struct RecordingBridge {
    ops: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, String)>>,
}

impl RecordingBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every publish/subscribe/unsubscribe, in call order, as
    /// `"pub:<topic>"` / `"sub:<topic>"` / `"unsub:<topic>"`.
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    /// Payloads published to one topic.
    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn publish_count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

#[async_trait]
impl MqttBridge for RecordingBridge {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.ops.lock().unwrap().push(format!("pub:{topic}"));
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.ops.lock().unwrap().push(format!("sub:{topic}"));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.ops.lock().unwrap().push(format!("unsub:{topic}"));
        Ok(())
    }
}

/// Rollback target counting how often it was reverted.
#[derive(Default)]
pub struct RollbackSpy(AtomicUsize);

impl RollbackSpy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl Revertible for RollbackSpy {
    fn revert(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
