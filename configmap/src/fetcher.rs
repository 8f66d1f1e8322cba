//! Loads the toolchain configs of one runtime from the config bucket.
//!
//! Descriptors are read with bounded concurrency. Each result is written to
//! the slot matching its position in the object listing, so the output order
//! does not depend on how the reads interleave.
use crate::metrics_defs::DESCRIPTORS_DROPPED;
use crate::storage::{ObjectAttrs, StorageClient, StorageError, base_name, parent_dir, split_gcs_path};
use crate::types::{
    BuildInfo, CmdDescriptor, PathType, RemoteexecPlatform, RuntimeConfig, Target,
    ToolchainConfig, merge_properties,
};
use shared::counter;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{AcquireError, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const DESCRIPTORS_DIR: &str = "descriptors";
pub const DEFAULT_CONCURRENCY_MULTIPLIER: usize = 4;

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("load {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: StorageError,
    },

    #[error("parse {name}: {source}")]
    Parse {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("fetch cancelled")]
    Cancelled,

    #[error("fetch task failed: {0}")]
    Task(#[from] JoinError),

    #[error("fetch semaphore closed: {0}")]
    Semaphore(#[from] AcquireError),
}

/// Why an object or descriptor was left out of the result.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
enum Rejection {
    #[error("disallowed prebuilt by {0}")]
    DisallowedPrebuilt(String),

    #[error("not allowed prebuilt")]
    NotAllowedPrebuilt,

    #[error("no selector specified")]
    NoSelector,

    #[error("disallowed by {field}: {value}")]
    DisallowedCommand { field: &'static str, value: String },

    #[error("no setup")]
    NoSetup,

    #[error("unknown path type")]
    UnknownPathType,
}

impl Rejection {
    fn reason(&self) -> &'static str {
        match self {
            Rejection::DisallowedPrebuilt(_) | Rejection::NotAllowedPrebuilt => "prebuilt",
            Rejection::NoSelector | Rejection::DisallowedCommand { .. } => "selector",
            Rejection::NoSetup => "no_setup",
            Rejection::UnknownPathType => "unknown_path_type",
        }
    }
}

/// `name` is `<runtime>/<prebuilt>/descriptors/<hash>`.
fn check_prebuilt(rc: &RuntimeConfig, name: &str) -> Result<(), Rejection> {
    let prebuilt = base_name(parent_dir(parent_dir(name)));
    if let Some(prefix) = rc
        .disallowed_prebuilts
        .iter()
        .find(|prefix| prebuilt.starts_with(prefix.as_str()))
    {
        return Err(Rejection::DisallowedPrebuilt(prefix.clone()));
    }
    if rc.allowed_prebuilts.is_empty()
        || rc
            .allowed_prebuilts
            .iter()
            .any(|prefix| prebuilt.starts_with(prefix.as_str()))
    {
        return Ok(());
    }
    Err(Rejection::NotAllowedPrebuilt)
}

fn check_descriptor(rc: &RuntimeConfig, descriptor: &CmdDescriptor) -> Result<(), Rejection> {
    let sel = descriptor.selector.as_ref().ok_or(Rejection::NoSelector)?;
    for deny in &rc.disallowed_commands {
        let fields = [
            ("name", &deny.name, &sel.name),
            ("version", &deny.version, &sel.version),
            ("target", &deny.target, &sel.target),
            ("binary hash", &deny.binary_hash, &sel.binary_hash),
        ];
        for (field, denied, actual) in fields {
            if !denied.is_empty() && denied == actual {
                return Err(Rejection::DisallowedCommand {
                    field,
                    value: denied.clone(),
                });
            }
        }
    }

    let setup = descriptor.setup.as_ref().ok_or(Rejection::NoSetup)?;
    if setup.path_type == PathType::Unknown {
        return Err(Rejection::UnknownPathType);
    }
    Ok(())
}

/// Loads toolchain configs from a bucket prefix.
pub struct ConfigLoader {
    storage: Arc<dyn StorageClient>,
    enable_parallel: bool,
    concurrency_multiplier: usize,
}

impl ConfigLoader {
    pub fn new(storage: Arc<dyn StorageClient>, enable_parallel: bool) -> Self {
        ConfigLoader {
            storage,
            enable_parallel,
            concurrency_multiplier: DEFAULT_CONCURRENCY_MULTIPLIER,
        }
    }

    pub fn with_concurrency_multiplier(mut self, multiplier: usize) -> Self {
        self.concurrency_multiplier = multiplier;
        self
    }

    fn concurrency(&self) -> usize {
        if !self.enable_parallel {
            return 1;
        }
        let cpus = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        cpus.saturating_mul(self.concurrency_multiplier).max(1)
    }

    /// Loads the configs of `rc` from `uri` (`gs://<bucket>/<runtime>/`).
    ///
    /// Every config targets `rc.service_addr`. When the runtime supports
    /// arbitrary toolchains a generic platform config is appended.
    pub async fn load(
        &self,
        cancel: &CancellationToken,
        uri: &str,
        rc: &RuntimeConfig,
    ) -> Result<Vec<ToolchainConfig>, FetchError> {
        let platform = RemoteexecPlatform {
            properties: rc.platform.properties.clone(),
            has_nsjail: rc
                .platform_runtime_config
                .as_ref()
                .is_some_and(|c| c.has_nsjail),
        };

        let mut configs = load_configs(
            &self.storage,
            cancel,
            uri,
            rc,
            &platform,
            self.concurrency(),
        )
        .await?;

        // The descriptor of this entry is generated per compile request.
        if let Some(runtime_config) = &rc.platform_runtime_config {
            configs.push(ToolchainConfig {
                target: None,
                build_info: None,
                cmd_descriptor: None,
                remoteexec_platform: platform,
                dimensions: runtime_config.dimensions.clone(),
                acl: rc.acl.clone(),
            });
        }
        Ok(configs)
    }
}

struct DescriptorJob {
    storage: Arc<dyn StorageClient>,
    bucket: String,
    rc: RuntimeConfig,
    platform: RemoteexecPlatform,
}

impl DescriptorJob {
    async fn fetch(&self, attrs: &ObjectAttrs) -> Result<Option<ToolchainConfig>, FetchError> {
        let buf = self
            .storage
            .read_object(&self.bucket, &attrs.name)
            .await
            .map_err(|source| FetchError::Read {
                name: attrs.name.clone(),
                source,
            })?;
        let descriptor: CmdDescriptor =
            serde_json::from_slice(&buf).map_err(|source| FetchError::Parse {
                name: attrs.name.clone(),
                source,
            })?;

        if let Err(rejection) = check_descriptor(&self.rc, &descriptor) {
            counter!(DESCRIPTORS_DROPPED, "reason" => rejection.reason()).increment(1);
            error!(bucket = %self.bucket, object = %attrs.name, error = %rejection, "drop descriptor");
            return Ok(None);
        }

        let mut properties = descriptor
            .platform
            .as_ref()
            .map(|p| p.properties.clone())
            .unwrap_or_default();
        merge_properties(&mut properties, &self.platform.properties);

        Ok(Some(ToolchainConfig {
            target: Some(Target {
                addr: self.rc.service_addr.clone(),
            }),
            build_info: Some(BuildInfo {
                timestamp: attrs.updated,
            }),
            cmd_descriptor: Some(descriptor),
            remoteexec_platform: RemoteexecPlatform {
                properties,
                has_nsjail: self.platform.has_nsjail,
            },
            dimensions: Vec::new(),
            acl: self.rc.acl.clone(),
        }))
    }
}

/// Lists `uri` and loads every accepted descriptor with at most `concurrency`
/// reads in flight.
///
/// The result follows the listing order regardless of `concurrency`. The
/// first read or parse error aborts the remaining reads and is returned.
pub async fn load_configs(
    storage: &Arc<dyn StorageClient>,
    cancel: &CancellationToken,
    uri: &str,
    rc: &RuntimeConfig,
    platform: &RemoteexecPlatform,
    concurrency: usize,
) -> Result<Vec<ToolchainConfig>, FetchError> {
    let (bucket, mut prefix) = split_gcs_path(uri)?;
    // Runtime directories only; `clang` must not list `clang-tidy/`.
    if !prefix.is_empty() && !prefix.ends_with('/') {
        prefix.push('/');
    }
    info!(bucket = %bucket, prefix = %prefix, "load configs");

    let start = Instant::now();
    let listed = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        listed = storage.list_objects(&bucket, &prefix) => listed?,
    };

    let candidates: Vec<ObjectAttrs> = listed
        .into_iter()
        .filter(|attrs| {
            if base_name(parent_dir(&attrs.name)) != DESCRIPTORS_DIR {
                debug!(object = %attrs.name, "ignore");
                return false;
            }
            match check_prebuilt(rc, &attrs.name) {
                Ok(()) => true,
                Err(rejection) => {
                    counter!(DESCRIPTORS_DROPPED, "reason" => rejection.reason()).increment(1);
                    info!(object = %attrs.name, error = %rejection, "skip prebuilt");
                    false
                }
            }
        })
        .collect();
    info!(bucket = %bucket, candidates = candidates.len(), elapsed = ?start.elapsed(), "listed descriptors");

    let start = Instant::now();
    let job = Arc::new(DescriptorJob {
        storage: storage.clone(),
        bucket: bucket.clone(),
        rc: rc.clone(),
        platform: platform.clone(),
    });
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut slots: Vec<Option<ToolchainConfig>> = vec![None; candidates.len()];
    // Dropping the set on an early return aborts the reads still running.
    let mut tasks = JoinSet::new();

    for (index, attrs) in candidates.iter().enumerate() {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            permit = semaphore.clone().acquire_owned() => permit?,
        };
        while let Some(joined) = tasks.try_join_next() {
            let (i, config) = joined??;
            slots[i] = config;
        }

        let job = job.clone();
        let attrs = attrs.clone();
        tasks.spawn(async move {
            let _permit = permit;
            job.fetch(&attrs).await.map(|config| (index, config))
        });
    }

    loop {
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            joined = tasks.join_next() => joined,
        };
        let Some(joined) = joined else {
            break;
        };
        let (i, config) = joined??;
        slots[i] = config;
    }

    let configs: Vec<ToolchainConfig> = slots.into_iter().flatten().collect();
    for config in &configs {
        if let Some(selector) = config.cmd_descriptor.as_ref().and_then(|d| d.selector.as_ref()) {
            debug!(bucket = %bucket, %selector, "loaded config");
        }
    }
    info!(
        bucket = %bucket,
        prefix = %prefix,
        configs = configs.len(),
        concurrency,
        elapsed = ?start.elapsed(),
        "loaded configs"
    );
    Ok(configs)
}
