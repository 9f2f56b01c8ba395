//! Fine-tune weight download from S3-compatible object storage (Cloudflare R2).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::error::ConfigError;

pub const DEFAULT_BUCKET: &str = "ratemepls-weights";

/// Populates a local directory with the weight bundle.
#[async_trait]
pub trait WeightFetcher: Send + Sync {
    /// Download into `local_dir` and return it.
    async fn fetch(&self, local_dir: &Path) -> Result<PathBuf, ConfigError>;
}

/// R2 connection settings as read from the command line or environment.
///
/// Everything except the bucket is optional here so that a server whose
/// weights are already on disk can start without credentials; [`validate`]
/// is the point where missing values become fatal.
///
/// [`validate`]: R2Settings::validate
#[derive(Debug, Clone, clap::Args)]
pub struct R2Settings {
    /// Bucket holding the fine-tuned weights.
    #[arg(long = "r2-bucket", env = "R2_BUCKET", default_value = DEFAULT_BUCKET)]
    pub bucket: String,
    /// Cloudflare account id.
    #[arg(long = "r2-account-id", env = "R2_ACCOUNT_ID")]
    pub account_id: Option<String>,
    #[arg(long = "r2-access-key-id", env = "R2_ACCESS_KEY_ID", hide_env_values = true)]
    pub access_key_id: Option<String>,
    #[arg(long = "r2-secret-access-key", env = "R2_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub secret_access_key: Option<String>,
    /// Folder in the bucket, e.g. `p2zil2wb_weights/`.
    ///
    /// Matched by whole path segments: `runs/p2zil` does not select objects
    /// under `runs/p2zil2wb_weights/`.
    #[arg(long = "r2-weights-prefix", env = "R2_WEIGHTS_PREFIX")]
    pub weights_prefix: Option<String>,
}

/// Validated R2 settings.
#[derive(Debug, Clone)]
pub struct R2Config {
    pub bucket: String,
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub weights_prefix: String,
}

impl R2Settings {
    pub fn validate(&self) -> Result<R2Config, ConfigError> {
        fn present(v: &Option<String>) -> Option<String> {
            v.as_deref().filter(|s| !s.is_empty()).map(str::to_owned)
        }
        let fields = [
            ("R2_ACCOUNT_ID", present(&self.account_id)),
            ("R2_ACCESS_KEY_ID", present(&self.access_key_id)),
            ("R2_SECRET_ACCESS_KEY", present(&self.secret_access_key)),
            ("R2_WEIGHTS_PREFIX", present(&self.weights_prefix)),
        ];
        let missing: Vec<&'static str> = fields
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingR2Settings(missing));
        }
        let [account_id, access_key_id, secret_access_key, weights_prefix] =
            fields.map(|(_, v)| v.unwrap_or_default());
        Ok(R2Config {
            bucket: self.bucket.clone(),
            account_id,
            access_key_id,
            secret_access_key,
            weights_prefix,
        })
    }
}

impl R2Config {
    pub fn endpoint(&self) -> String {
        format!("https://{}.r2.cloudflarestorage.com", self.account_id)
    }

    /// R2 is S3-compatible; region is always `auto`.
    pub fn into_fetcher(self) -> Result<ObjectStoreFetcher, ConfigError> {
        let store = AmazonS3Builder::new()
            .with_endpoint(self.endpoint())
            .with_bucket_name(&self.bucket)
            .with_access_key_id(&self.access_key_id)
            .with_secret_access_key(&self.secret_access_key)
            .with_region("auto")
            .build()?;
        Ok(ObjectStoreFetcher::new(Arc::new(store), self.bucket, self.weights_prefix))
    }
}

#[async_trait]
impl WeightFetcher for R2Settings {
    async fn fetch(&self, local_dir: &Path) -> Result<PathBuf, ConfigError> {
        self.validate()?.into_fetcher()?.fetch(local_dir).await
    }
}

/// Mirrors every object under a prefix into a local directory.
pub struct ObjectStoreFetcher {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl ObjectStoreFetcher {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }
}

/// Zero-length placeholder objects some consoles create for folders. Keys
/// with a trailing delimiter are normalized by [`ObjectPath`] and surface as
/// an empty relative path instead.
fn is_directory_marker(meta: &ObjectMeta) -> bool {
    meta.size == 0
}

/// Path segments of `location` below `prefix`, `None` if nothing remains.
fn relative_parts(location: &ObjectPath, prefix: &ObjectPath) -> Option<Vec<String>> {
    let parts: Vec<String> = location
        .prefix_match(prefix)?
        .map(|p| p.as_ref().to_string())
        .collect();
    (!parts.is_empty()).then_some(parts)
}

fn join_parts(base: &Path, parts: &[String]) -> PathBuf {
    parts.iter().fold(base.to_path_buf(), |p, part| p.join(part))
}

/// Scratch directory next to `local_dir`, removed on drop.
fn staging_dir(local_dir: &Path) -> Result<TempDir, ConfigError> {
    let parent = match local_dir.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent).map_err(|e| ConfigError::io(&parent, e))?;
    tempfile::Builder::new()
        .prefix(".weights-download-")
        .tempdir_in(&parent)
        .map_err(|e| ConfigError::io(&parent, e))
}

impl ObjectStoreFetcher {
    /// Download every object below the prefix into `staging`, returning the
    /// relative paths written.
    async fn download_all(&self, staging: &Path) -> Result<Vec<Vec<String>>, ConfigError> {
        let prefix = ObjectPath::from(self.prefix.as_str());
        info!("listing objects in bucket '{}' with prefix '{}'", self.bucket, self.prefix);
        let objects: Vec<ObjectMeta> = self.store.list(Some(&prefix)).try_collect().await?;
        if objects.is_empty() {
            return Err(ConfigError::NoRemoteObjects {
                bucket: self.bucket.clone(),
                prefix: self.prefix.clone(),
            });
        }

        let mut written = Vec::with_capacity(objects.len());
        for meta in objects {
            if is_directory_marker(&meta) {
                debug!("skipping directory marker {}", meta.location);
                continue;
            }
            let Some(parts) = relative_parts(&meta.location, &prefix) else {
                continue;
            };
            let path = join_parts(staging, &parts);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ConfigError::io(parent, e))?;
            }

            info!("downloading {}", meta.location);
            let bytes = self.store.get(&meta.location).await?.bytes().await?;
            tokio::fs::write(&path, &bytes)
                .await
                .map_err(|e| ConfigError::io(&path, e))?;
            written.push(parts);
        }
        Ok(written)
    }
}

#[async_trait]
impl WeightFetcher for ObjectStoreFetcher {
    /// Objects land in a scratch directory first and are moved into
    /// `local_dir` only once every download succeeded. A failed fetch leaves
    /// `local_dir` as it was, absent included.
    async fn fetch(&self, local_dir: &Path) -> Result<PathBuf, ConfigError> {
        let staging = staging_dir(local_dir)?;
        let written = self.download_all(staging.path()).await?;

        for parts in &written {
            let from = join_parts(staging.path(), parts);
            let to = join_parts(local_dir, parts);
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ConfigError::io(parent, e))?;
            }
            tokio::fs::rename(&from, &to)
                .await
                .map_err(|e| ConfigError::io(&to, e))?;
        }
        // An all-marker listing still yields the directory.
        tokio::fs::create_dir_all(local_dir)
            .await
            .map_err(|e| ConfigError::io(local_dir, e))?;

        info!("downloaded {} files to {}", written.len(), local_dir.display());
        Ok(local_dir.to_path_buf())
    }
}
