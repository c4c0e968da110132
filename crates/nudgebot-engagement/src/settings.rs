//! Layered config lookup: runtime overrides in `app_config`, then the TOML file.

use std::sync::Arc;

use nudgebot_core::config::{ConfigSource, EngagementSettings};

use crate::store::EngagementDb;

pub struct LayeredConfig {
    overrides: Arc<EngagementDb>,
    file: toml::Value,
}

impl LayeredConfig {
    pub fn new(overrides: Arc<EngagementDb>, file: toml::Value) -> Self {
        Self { overrides, file }
    }

    /// Fresh snapshot; overrides written since the last call are picked up.
    pub fn settings(&self) -> EngagementSettings {
        EngagementSettings::load(self)
    }
}

impl ConfigSource for LayeredConfig {
    fn lookup(&self, path: &str) -> Option<serde_json::Value> {
        match self.overrides.get_config(path) {
            Ok(Some(value)) => Some(value),
            Ok(None) => self.file.lookup(path),
            Err(e) => {
                tracing::warn!("⚠️ Config override lookup for '{path}' failed: {e}");
                self.file.lookup(path)
            }
        }
    }
}
