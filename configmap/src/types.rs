use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use time::OffsetDateTime;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: String,
}

impl Property {
    pub fn new<N, V>(name: N, value: V) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        Property {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Platform {
    pub properties: Vec<Property>,
}

/// Present on runtimes that can run arbitrary toolchains whose descriptors
/// are generated per request instead of being published to the bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformRuntimeConfig {
    pub dimensions: Vec<String>,
    pub has_nsjail: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Acl {
    pub allowed_groups: Vec<String>,
    pub disallowed_groups: Vec<String>,
}

/// Identifies one variant of a compiler invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Selector {
    pub name: String,
    pub version: String,
    pub target: String,
    pub binary_hash: String,
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{} ({})",
            self.name, self.version, self.target, self.binary_hash
        )
    }
}

/// One named runtime from the config map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub name: String,
    /// Empty means "use the process-wide remote execution address".
    #[serde(default)]
    pub service_addr: String,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub platform_runtime_config: Option<PlatformRuntimeConfig>,
    /// Prefixes of prebuilt item names to accept. Empty accepts everything
    /// not disallowed.
    #[serde(default)]
    pub allowed_prebuilts: Vec<String>,
    #[serde(default)]
    pub disallowed_prebuilts: Vec<String>,
    #[serde(default)]
    pub disallowed_commands: Vec<Selector>,
    #[serde(default)]
    pub acl: Option<Acl>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigMap {
    pub runtimes: Vec<RuntimeConfig>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PathType {
    #[default]
    Unknown,
    Posix,
    Windows,
}

impl From<String> for PathType {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "posix" => PathType::Posix,
            "windows" => PathType::Windows,
            _ => PathType::Unknown,
        }
    }
}

impl From<PathType> for String {
    fn from(path_type: PathType) -> Self {
        match path_type {
            PathType::Unknown => "unknown",
            PathType::Posix => "posix",
            PathType::Windows => "windows",
        }
        .to_string()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Setup {
    pub path_type: PathType,
    pub cmd_dir: String,
}

/// Descriptor object stored at `<runtime>/<prebuilt>/descriptors/<hash>`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CmdDescriptor {
    pub selector: Option<Selector>,
    pub setup: Option<Setup>,
    /// Toolchain specific platform requirements. Runtime properties are
    /// merged in underneath these.
    pub platform: Option<Platform>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteexecPlatform {
    pub properties: Vec<Property>,
    pub has_nsjail: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub addr: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// A resolved toolchain config as served to clients.
///
/// `cmd_descriptor` is `None` for the generic platform entry of a runtime that
/// supports arbitrary toolchains.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainConfig {
    pub target: Option<Target>,
    pub build_info: Option<BuildInfo>,
    pub cmd_descriptor: Option<CmdDescriptor>,
    pub remoteexec_platform: RemoteexecPlatform,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dimensions: Vec<String>,
    pub acl: Option<Acl>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigResp {
    pub version_id: String,
    pub configs: Vec<ToolchainConfig>,
}

/// Appends the properties of `source` whose names are not already present in
/// `target`. Existing target properties are never overwritten.
pub fn merge_properties(target: &mut Vec<Property>, source: &[Property]) {
    let existing: HashSet<String> = target.iter().map(|p| p.name.clone()).collect();
    for p in source {
        if existing.contains(&p.name) {
            continue;
        }
        target.push(p.clone());
    }
}
