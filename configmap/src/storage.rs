//! Object storage access for the toolchain config bucket.
//!
//! The bucket layout is
//!
//! ```text
//! <runtime>/seq                                   text, sequence token
//! <runtime>/<prebuilt>/descriptors/<hash>         JSON CmdDescriptor
//! ```
use crate::auth::AuthError;
use crate::pubsub::Topic;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("object not found: {bucket}/{name}")]
    NotFound { bucket: String, name: String },

    #[error("not gs: URI: {0:?}")]
    InvalidUri(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("storage request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("storage call failed: {0}")]
    Gcs(#[from] google_cloud_gax::error::Error),

    #[error("could not build storage client: {0}")]
    Client(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("storage returned {status} for {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("invalid storage response: {0}")]
    InvalidResponse(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectAttrs {
    pub name: String,
    pub updated: OffsetDateTime,
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Lists every object whose name starts with `prefix`, in name order.
    async fn list_objects(&self, bucket: &str, prefix: &str)
    -> Result<Vec<ObjectAttrs>, StorageError>;

    /// Reads the whole object. Missing objects are `StorageError::NotFound`.
    async fn read_object(&self, bucket: &str, name: &str) -> Result<Vec<u8>, StorageError>;

    /// Pub/Sub topics configured to receive change notifications for `bucket`.
    async fn notification_topics(&self, bucket: &str) -> Result<Vec<Topic>, StorageError>;
}

/// Splits `gs://<bucket>/<path>` into bucket and path.
pub fn split_gcs_path(uri: &str) -> Result<(String, String), StorageError> {
    let rest = uri
        .strip_prefix("gs://")
        .ok_or_else(|| StorageError::InvalidUri(uri.to_string()))?;
    match rest.split_once('/') {
        Some((bucket, path)) => Ok((bucket.to_string(), path.to_string())),
        None => Ok((rest.to_string(), String::new())),
    }
}

/// Last element of a slash separated object name, ignoring trailing slashes.
pub fn base_name(name: &str) -> &str {
    let trimmed = name.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, base)) => base,
        None => trimmed,
    }
}

/// Everything before the last element of a slash separated object name.
pub fn parent_dir(name: &str) -> &str {
    let trimmed = name.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    }
}

/// Serves a bucket mirrored on local disk at `<base_dir>/<bucket>/`.
///
/// There is no notification support, so watchers over this storage always
/// fall back to polling.
pub struct FilesystemStorage {
    base_dir: PathBuf,
}

impl FilesystemStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        FilesystemStorage {
            base_dir: base_dir.into(),
        }
    }

    fn object_path(&self, bucket: &str, name: &str) -> PathBuf {
        let mut path = self.base_dir.join(bucket);
        for part in name.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<ObjectAttrs>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, out)?;
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let updated = OffsetDateTime::from(entry.metadata()?.modified()?);
        out.push(ObjectAttrs { name, updated });
    }
    Ok(())
}

#[async_trait]
impl StorageClient for FilesystemStorage {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectAttrs>, StorageError> {
        let root = self.base_dir.join(bucket);
        let prefix = prefix.to_string();
        let objects = tokio::task::spawn_blocking(move || -> io::Result<Vec<ObjectAttrs>> {
            let mut objects = Vec::new();
            match walk(&root, &root, &mut objects) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
            objects.retain(|o| o.name.starts_with(&prefix));
            objects.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(objects)
        })
        .await
        .map_err(io::Error::other)??;
        Ok(objects)
    }

    async fn read_object(&self, bucket: &str, name: &str) -> Result<Vec<u8>, StorageError> {
        match tokio::fs::read(self.object_path(bucket, name)).await {
            Ok(buf) => Ok(buf),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                name: name.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn notification_topics(&self, _bucket: &str) -> Result<Vec<Topic>, StorageError> {
        Ok(Vec::new())
    }
}
