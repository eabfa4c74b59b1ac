use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::OffloadError;
use crate::keys::BulkCipher;
use crate::kind::OperationKind;

/// What the engine does for a kind nobody offloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Use the engine's own implementation.
    BuiltIn,
    /// Abort the handshake.
    FailHandshake,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadConfig {
    /// Kinds to route through the reference handlers.
    #[serde(default)]
    pub offload: Vec<OperationKind>,
    pub fallback: FallbackPolicy,
    pub cipher: BulkCipher,
    /// Records exchanged by the demo driver.
    #[serde(default = "default_records")]
    pub records: usize,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_records() -> usize {
    4
}

fn default_log_filter() -> String {
    "offload_core=info,offload_cli=info".into()
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            offload: OperationKind::ALL.to_vec(),
            fallback: FallbackPolicy::BuiltIn,
            cipher: BulkCipher::AesGcm,
            records: default_records(),
            log_filter: default_log_filter(),
        }
    }
}

impl OffloadConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OffloadError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn to_json(&self) -> Result<String, OffloadError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn offloads(&self, kind: OperationKind) -> bool {
        self.offload.contains(&kind)
    }
}
