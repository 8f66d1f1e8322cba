use crate::types::{ConfigResp, ToolchainConfig};
use parking_lot::RwLock;
use std::collections::HashMap;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

struct StoredConfigs {
    seq: String,
    configs: Vec<ToolchainConfig>,
}

/// Latest toolchain configs keyed by runtime name.
pub struct ConfigStore {
    last_configs: RwLock<HashMap<String, StoredConfigs>>,
    version_id: fn() -> String,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Current time in RFC 3339, UTC.
pub fn version_id() -> String {
    let now = OffsetDateTime::now_utc().replace_nanosecond(0);
    match now {
        Ok(now) => now.format(&Rfc3339).unwrap_or_default(),
        Err(_) => String::new(),
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::with_version_id(version_id)
    }

    pub fn with_version_id(version_id: fn() -> String) -> Self {
        ConfigStore {
            last_configs: RwLock::new(HashMap::new()),
            version_id,
        }
    }

    /// Runtime names in sorted order.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.last_configs.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn set(&self, name: &str, seq: &str, configs: Vec<ToolchainConfig>) {
        self.last_configs.write().insert(
            name.to_string(),
            StoredConfigs {
                seq: seq.to_string(),
                configs,
            },
        );
    }

    /// `None` when nothing is stored for `name`.
    pub fn seq(&self, name: &str) -> Option<String> {
        self.last_configs.read().get(name).map(|c| c.seq.clone())
    }

    pub fn delete(&self, name: &str) {
        self.last_configs.write().remove(name);
    }

    /// Concatenation of all stored configs ordered by runtime name, under a
    /// fresh version id.
    pub fn config_resp(&self) -> ConfigResp {
        let last_configs = self.last_configs.read();
        let mut names: Vec<&String> = last_configs.keys().collect();
        names.sort();

        let configs = names
            .into_iter()
            .flat_map(|name| last_configs[name].configs.iter().cloned())
            .collect();
        ConfigResp {
            version_id: (self.version_id)(),
            configs,
        }
    }
}
