//! Test support: a concrete status update type and a forwarding probe.

use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::manager::{ForwardFn, PathFn};
use crate::update::{PayloadCodecError, StatusUpdate};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestFrameworkId(pub String);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestUpdate {
    pub uuid: Option<Uuid>,
    pub framework: Option<TestFrameworkId>,
    pub terminal: bool,
    pub message: String,
}

impl TestUpdate {
    pub fn new(seed: u8) -> Self {
        Self {
            uuid: Some(Uuid::from_bytes([seed; 16])),
            framework: None,
            terminal: false,
            message: format!("update-{seed}"),
        }
    }

    pub fn terminal(seed: u8) -> Self {
        Self {
            terminal: true,
            ..Self::new(seed)
        }
    }

    pub fn with_framework(mut self, framework: &str) -> Self {
        self.framework = Some(TestFrameworkId(framework.to_string()));
        self
    }

    pub fn without_uuid(mut self) -> Self {
        self.uuid = None;
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid.expect("test update has a uuid")
    }
}

impl StatusUpdate for TestUpdate {
    type FrameworkId = TestFrameworkId;

    fn status_uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    fn framework_id(&self) -> Option<TestFrameworkId> {
        self.framework.clone()
    }

    fn is_terminal(&self) -> bool {
        self.terminal
    }

    fn encode_payload(&self) -> Result<Bytes, PayloadCodecError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    fn decode_payload(bytes: &[u8]) -> Result<Self, PayloadCodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Captures every update handed to the forward sink.
#[derive(Clone, Default)]
pub struct ForwardProbe {
    forwarded: Arc<Mutex<Vec<TestUpdate>>>,
}

impl ForwardProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> ForwardFn<TestUpdate> {
        let forwarded = Arc::clone(&self.forwarded);
        Box::new(move |update: &TestUpdate| {
            forwarded.lock().expect("probe lock").push(update.clone());
        })
    }

    pub fn forwarded(&self) -> Vec<TestUpdate> {
        self.forwarded.lock().expect("probe lock").clone()
    }

    pub fn count(&self) -> usize {
        self.forwarded.lock().expect("probe lock").len()
    }
}

/// Path resolver placing `<stream_id>.updates` files under `dir`.
pub fn path_in(dir: &Path) -> PathFn<String> {
    let dir = dir.to_path_buf();
    Box::new(move |stream_id: &String| dir.join(format!("{stream_id}.updates")))
}
