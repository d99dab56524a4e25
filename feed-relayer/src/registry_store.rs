//! Durable mapping from signing identity to its registered feed.
//!
//! The [`RegistryStore`] trait is the only place feed registrations are kept.
//! [`JsonFileRegistryStore`] persists them in a pretty-printed JSON object of
//! `"<ss58 address>": <feed id>` pairs, rewritten atomically on every new
//! registration. [`MemoryRegistryStore`] keeps them in memory only.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use log::{info, warn};
use snafu::ResultExt;
use subxt::utils::AccountId32;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{Error, Result, StoreSerializeSnafu, StoreWriteSnafu};
use crate::model::FeedId;

/// Persisted identity → feed mapping.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// The feed recorded for `identity`, if any. Never touches the network.
    fn lookup(&self, identity: &AccountId32) -> Option<FeedId>;

    /// Durably records `identity → feed_id`.
    ///
    /// Recording the pair already on file is a no-op. Recording a different feed for an
    /// identity that already has one fails with [`Error::FeedConflict`]. Once this
    /// returns `Ok`, [`RegistryStore::lookup`] returns `feed_id`, across restarts for
    /// durable stores.
    async fn record(&self, identity: &AccountId32, feed_id: FeedId) -> Result<()>;
}

/// Map of ss58 address to feed id, the on-disk format.
type FeedMap = BTreeMap<String, FeedId>;

/// Checks that `feed_id` may be recorded for `address` in `feeds`.
///
/// Returns `false` when the exact pair is already recorded.
fn check_new_record(feeds: &FeedMap, address: &str, feed_id: FeedId) -> Result<bool> {
    match feeds.get(address) {
        Some(existing) if *existing == feed_id => Ok(false),
        Some(existing) => Err(Error::FeedConflict {
            identity: address.to_string(),
            existing: *existing,
            attempted: feed_id,
        }),
        None => Ok(true),
    }
}

/// A [`RegistryStore`] persisted as a JSON file.
pub struct JsonFileRegistryStore {
    /// Location of the registry file.
    path: PathBuf,
    /// Registrations that are known to be on disk.
    feeds: RwLock<FeedMap>,
    /// Serializes writers so each rewrite starts from the latest persisted state.
    writer: Mutex<()>,
}

impl JsonFileRegistryStore {
    /// Loads the registry at `path`.
    ///
    /// A missing file is an empty registry. Any other read failure, malformed JSON, or a
    /// key that is not a valid address is reported as [`Error::StoreCorruption`].
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let feeds = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => parse_registry(&path, &contents)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("No feed registry at {}, starting empty", path.display());
                FeedMap::new()
            }
            Err(err) => {
                return Err(Error::StoreCorruption {
                    path,
                    reason: err.to_string(),
                })
            }
        };

        info!(
            "Loaded {} feed registrations from {}",
            feeds.len(),
            path.display()
        );

        Ok(Self {
            path,
            feeds: RwLock::new(feeds),
            writer: Mutex::new(()),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parses the registry file, keying every record by the canonical address of its account.
///
/// The same account written under several SS58 prefixes collapses into one record, and is
/// corrupt if those records disagree on the feed.
fn parse_registry(path: &Path, contents: &str) -> Result<FeedMap> {
    let corrupt = |reason: String| Error::StoreCorruption {
        path: path.to_path_buf(),
        reason,
    };

    let raw: FeedMap = serde_json::from_str(contents).map_err(|err| corrupt(err.to_string()))?;

    let mut feeds = FeedMap::new();
    for (key, feed_id) in raw {
        let account = AccountId32::from_str(&key)
            .map_err(|_| corrupt(format!("'{key}' is not a valid address")))?;
        let address = account.to_string();
        if let Some(existing) = feeds.insert(address.clone(), feed_id) {
            if existing != feed_id {
                return Err(corrupt(format!(
                    "{address} is recorded with both feed {existing} and feed {feed_id}"
                )));
            }
        }
    }

    Ok(feeds)
}

#[async_trait]
impl RegistryStore for JsonFileRegistryStore {
    fn lookup(&self, identity: &AccountId32) -> Option<FeedId> {
        self.feeds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&identity.to_string())
            .copied()
    }

    async fn record(&self, identity: &AccountId32, feed_id: FeedId) -> Result<()> {
        let address = identity.to_string();
        let _writer = self.writer.lock().await;

        let mut updated = self
            .feeds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if !check_new_record(&updated, &address, feed_id)? {
            return Ok(());
        }
        updated.insert(address.clone(), feed_id);

        let contents = serde_json::to_string_pretty(&updated).context(StoreSerializeSnafu)?;
        write_atomic(&self.path, contents.as_bytes())
            .await
            .context(StoreWriteSnafu {
                path: self.path.clone(),
            })?;

        // Lookups only observe the new pair once it is on disk.
        *self.feeds.write().unwrap_or_else(PoisonError::into_inner) = updated;
        info!("Recorded feed {feed_id} for {address} in {}", self.path.display());
        Ok(())
    }
}

/// Writes `bytes` to `path` atomically.
///
/// The data is written to `<path>.tmp` and fsynced, then renamed over `path`, and the
/// parent directory is fsynced. A crash at any point leaves either the old or the new
/// file in place.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp_path = tmp_path(path);

    let written = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp_path, path).await
    }
    .await;

    if let Err(err) = written {
        if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await {
            warn!("Failed to remove {}: {}", tmp_path.display(), cleanup);
        }
        return Err(err);
    }

    fsync_parent(path).await
}

/// `<path>.tmp`, next to the registry file.
fn tmp_path(path: &Path) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Flushes the rename of the registry file to disk.
#[cfg(target_family = "unix")]
async fn fsync_parent(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    tokio::fs::File::open(parent).await?.sync_all().await
}

/// Directories cannot be opened for syncing here.
#[cfg(not(target_family = "unix"))]
async fn fsync_parent(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// A [`RegistryStore`] that lives only as long as the process.
#[derive(Default)]
pub struct MemoryRegistryStore {
    /// Recorded feeds by address.
    feeds: RwLock<FeedMap>,
}

impl MemoryRegistryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded identities.
    pub fn len(&self) -> usize {
        self.feeds.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    fn lookup(&self, identity: &AccountId32) -> Option<FeedId> {
        self.feeds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&identity.to_string())
            .copied()
    }

    async fn record(&self, identity: &AccountId32, feed_id: FeedId) -> Result<()> {
        let address = identity.to_string();
        let mut feeds = self.feeds.write().unwrap_or_else(PoisonError::into_inner);
        if check_new_record(&feeds, &address, feed_id)? {
            feeds.insert(address, feed_id);
        }
        Ok(())
    }
}
