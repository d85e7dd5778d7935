//! A [`Store`] that keeps entries on local disk so that a cached database
//! survives restarts of the process.
//!
//! Each key is kept in its own `<key>.json` file holding the hosts and an
//! absolute expiry in unix milliseconds. Files are replaced atomically so
//! concurrent readers see either the old or the new entry. Expired files
//! are left in place until the next write replaces them.

use ingress_info_core::{IngressDb, Store, StoreError};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tracing::trace;

#[derive(Clone, Debug)]
pub struct DiskStore {
    dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct DiskEntry {
    expires_at_ms: u64,
    hosts: IngressDb,
}

// === impl DiskStore ===

impl DiskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_filename(key)))
    }
}

#[async_trait::async_trait]
impl Store for DiskStore {
    async fn get(&self, key: &str) -> Result<Option<Arc<IngressDb>>, StoreError> {
        let path = self.path(key);
        blocking(move || read_entry(&path)).await
    }

    async fn set(&self, key: &str, db: Arc<IngressDb>, ttl: Duration) -> Result<(), StoreError> {
        let path = self.path(key);
        let entry = DiskEntry {
            expires_at_ms: unix_now_ms().saturating_add(millis(ttl)),
            hosts: (*db).clone(),
        };
        blocking(move || {
            let bytes = serde_json::to_vec(&entry)?;
            atomic_write(&path, &bytes)?;
            trace!(path = %path.display(), "Wrote cache entry");
            Ok(())
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(io::Error::other(e)))?
}

fn read_entry(path: &Path) -> Result<Option<Arc<IngressDb>>, StoreError> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let entry: DiskEntry = serde_json::from_slice(&content)?;
    if unix_now_ms() < entry.expires_at_ms {
        return Ok(Some(Arc::new(entry.hosts)));
    }

    trace!(path = %path.display(), "Cache entry expired");
    Ok(None)
}

/// Writes to a temporary file in the same directory and renames it over
/// `path`.
fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(content)?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn unix_now_ms() -> u64 {
    millis(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default(),
    )
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn sanitize_filename(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_info_core::INGRESS_DB_KEY;

    fn db() -> Arc<IngressDb> {
        Arc::new(
            ["a.example.com", "b.example.com"]
                .into_iter()
                .collect(),
        )
    }

    #[tokio::test]
    async fn round_trips_fresh_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();

        assert_eq!(store.get(INGRESS_DB_KEY).await.unwrap(), None);
        store
            .set(INGRESS_DB_KEY, db(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(dir.path().join("INGRESS_DB.json").exists());
        assert_eq!(store.get(INGRESS_DB_KEY).await.unwrap(), Some(db()));

        // A second store over the same directory sees the entry.
        let reopened = DiskStore::new(dir.path()).unwrap();
        assert_eq!(reopened.get(INGRESS_DB_KEY).await.unwrap(), Some(db()));
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss_until_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();

        store.set(INGRESS_DB_KEY, db(), Duration::ZERO).await.unwrap();
        assert_eq!(store.get(INGRESS_DB_KEY).await.unwrap(), None);

        // The stale read leaves the file for the next writer to replace.
        assert!(dir.path().join("INGRESS_DB.json").exists());
        let writer = DiskStore::new(dir.path()).unwrap();
        writer
            .set(INGRESS_DB_KEY, db(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(store.get(INGRESS_DB_KEY).await.unwrap(), Some(db()));
    }

    #[tokio::test]
    async fn subsecond_ttl_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();

        store
            .set(INGRESS_DB_KEY, db(), Duration::from_millis(900))
            .await
            .unwrap();
        assert_eq!(store.get(INGRESS_DB_KEY).await.unwrap(), Some(db()));
    }

    #[tokio::test]
    async fn unbounded_ttl_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();

        store
            .set(INGRESS_DB_KEY, db(), Duration::from_secs(u64::MAX))
            .await
            .unwrap();
        assert_eq!(store.get(INGRESS_DB_KEY).await.unwrap(), Some(db()));
    }

    #[tokio::test]
    async fn corrupt_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("INGRESS_DB.json"), b"{not json").unwrap();

        assert!(matches!(
            store.get(INGRESS_DB_KEY).await,
            Err(StoreError::Json(_))
        ));
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        DiskStore::new(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn sanitizes_keys() {
        assert_eq!(sanitize_filename("INGRESS_DB"), "INGRESS_DB");
        assert_eq!(sanitize_filename("../etc/passwd"), "___etc_passwd");
    }
}
