use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Error};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use tempfile::NamedTempFile;
use tokio::fs::{self, File};
use tokio::io::{self, AsyncWriteExt};

use super::{SharedCacheBackend, SharedCacheError};

/// A shared cache backend that stores one file per entry below a root directory.
///
/// Files are written atomically, so concurrent readers never observe partial entries. Entries
/// are kept until they are removed, the retention passed to `store` is not enforced.
#[derive(Debug, Clone)]
pub struct FilesystemSharedCache {
    path: PathBuf,
}

impl FilesystemSharedCache {
    /// Creates the backend, making sure the root directory exists.
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        fs::create_dir_all(&path)
            .await
            .with_context(|| format!("failed to create shared cache dir {}", path.display()))?;
        Ok(Self { path })
    }

    async fn fetch_file(&self, key: &str) -> Result<Option<Bytes>, SharedCacheError> {
        let abspath = self.path.join(key);
        tracing::trace!("Fetching shared cache entry from {}", abspath.display());
        match fs::read(&abspath).await {
            Ok(content) => Ok(Some(content.into())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context("Failed to read file in shared cache")?,
        }
    }

    async fn store_file(&self, key: &str, content: Bytes) -> Result<u64, SharedCacheError> {
        let abspath = self.path.join(key);
        let parent_dir = abspath
            .parent()
            .ok_or_else(|| Error::msg("Shared cache directory not found"))?;

        let temp_dir = parent_dir.join(".tmp");
        fs::create_dir_all(&temp_dir)
            .await
            .context("failed to create tempdir")?;
        let temp_file = NamedTempFile::new_in(&temp_dir).context("failed to create tempfile")?;
        let dup_file = temp_file.reopen().context("failed to dup filedescriptor")?;
        let mut dest = File::from_std(dup_file);

        dest.write_all(&content)
            .await
            .context("Failed to copy data into file")?;
        dest.flush().await.context("Failed to flush file")?;

        temp_file
            .persist(&abspath)
            .context("Failed to save file in shared cache")?;
        Ok(content.len() as u64)
    }

    async fn remove_file(&self, key: &str) -> Result<(), SharedCacheError> {
        match fs::remove_file(self.path.join(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context("Failed to remove file from shared cache")?,
        }
    }
}

impl SharedCacheBackend for FilesystemSharedCache {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, SharedCacheError>> {
        self.fetch_file(key).boxed()
    }

    fn store<'a>(
        &'a self,
        key: &'a str,
        content: Bytes,
        _retain_for: Duration,
    ) -> BoxFuture<'a, Result<u64, SharedCacheError>> {
        self.store_file(key, content).boxed()
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), SharedCacheError>> {
        self.remove_file(key).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_fetch_remove() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FilesystemSharedCache::new(dir.path().join("shared"))
            .await
            .unwrap();
        let key = "hybrid-cache/82/54c329/a928";
        let retain = Duration::from_secs(60);

        assert_eq!(cache.fetch(key).await.unwrap(), None);

        let written = cache
            .store(key, Bytes::from_static(b"cache data"), retain)
            .await
            .unwrap();
        assert_eq!(written, 10);
        assert_eq!(
            std::fs::read(dir.path().join("shared").join(key)).unwrap(),
            b"cache data"
        );

        // writes always replace the existing file
        cache
            .store(key, Bytes::from_static(b"newer data"), retain)
            .await
            .unwrap();
        assert_eq!(
            cache.fetch(key).await.unwrap().as_deref(),
            Some(&b"newer data"[..])
        );

        cache.remove(key).await.unwrap();
        cache.remove(key).await.unwrap();
        assert_eq!(cache.fetch(key).await.unwrap(), None);
    }
}
