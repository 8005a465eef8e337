use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::RecordingSource;
use crate::{PipelineError, Result};

/// Fetches remote media to a local destination. The download itself is an
/// external concern; the cache manager guarantees it runs at most once per
/// cache key.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, remote_id: &str, dest: &Path) -> anyhow::Result<()>;
}

/// Result of resolving a recording source to a local media file.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub local_path: PathBuf,
    pub recording_id: String,
    /// Whether the media was reused from the cache
    pub cached: bool,
}

/// Acquisition cache for remote recordings.
///
/// Entries live under the cache root, keyed by the source's stable cache
/// key. Writes are staged to a temp file in the same directory and renamed
/// into place, so a crash mid-download never leaves a corrupt entry.
/// Same-key writers serialize on a key-scoped lock; reads of a fully
/// written entry take no lock.
pub struct MediaCache {
    root: PathBuf,
    writer_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    fetch_timeout: Option<Duration>,
}

impl MediaCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writer_locks: Mutex::new(HashMap::new()),
            fetch_timeout: None,
        }
    }

    /// Bound each fetch; a fired timeout surfaces as a retrieval error.
    pub fn with_fetch_timeout(mut self, limit: Duration) -> Self {
        self.fetch_timeout = Some(limit);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the cache entry for a key.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    async fn writer_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.writer_locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Resolve a source to a local media file, fetching at most once.
    ///
    /// Local-path sources bypass the cache entirely. Remote sources reuse an
    /// existing entry unless `force_refresh` is set. Network or permission
    /// failure surfaces as the fatal [`PipelineError::Retrieval`].
    pub async fn acquire(
        &self,
        source: &mut RecordingSource,
        force_refresh: bool,
        fetcher: &dyn Fetch,
    ) -> Result<Acquired> {
        let Some(remote_id) = source.remote_id.clone() else {
            return self.acquire_local(source);
        };

        let key = source
            .cache_key()
            .ok_or_else(|| PipelineError::Retrieval("remote source has no cache key".to_string()))?;
        let entry = self.entry_path(&key);

        // Fast path: a fully written entry needs no lock.
        if !force_refresh && entry.is_file() {
            info!("cache hit for {} at {}", remote_id, entry.display());
            source.resolve(&entry, true);
            return Ok(Acquired {
                local_path: entry,
                recording_id: key,
                cached: true,
            });
        }

        let lock = self.writer_lock(&key).await;
        let _guard = lock.lock().await;

        // Another run may have completed the download while we waited.
        if !force_refresh && entry.is_file() {
            debug!("cache entry for {} appeared while waiting on writer lock", key);
            source.resolve(&entry, true);
            return Ok(Acquired {
                local_path: entry,
                recording_id: key,
                cached: true,
            });
        }

        tokio::fs::create_dir_all(&self.root).await?;

        // Stage into the cache root so the final rename stays on one filesystem.
        let staging = tempfile::NamedTempFile::new_in(&self.root)
            .map_err(|e| PipelineError::Retrieval(format!("failed to stage download: {e}")))?;
        let staging_path = staging.path().to_path_buf();

        info!("fetching {} into cache", remote_id);
        let fetch = fetcher.fetch(&remote_id, &staging_path);
        let fetched = match self.fetch_timeout {
            Some(limit) => match tokio::time::timeout(limit, fetch).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(PipelineError::Retrieval(format!(
                        "fetch of {remote_id} timed out after {:.0}s",
                        limit.as_secs_f64()
                    )))
                }
            },
            None => fetch.await,
        };
        fetched
            .map_err(|e| PipelineError::Retrieval(format!("fetch of {remote_id} failed: {e:#}")))?;

        staging
            .persist(&entry)
            .map_err(|e| PipelineError::Retrieval(format!("failed to commit cache entry: {e}")))?;

        debug!("cached {} at {}", remote_id, entry.display());
        source.resolve(&entry, false);
        Ok(Acquired {
            local_path: entry,
            recording_id: key,
            cached: false,
        })
    }

    fn acquire_local(&self, source: &mut RecordingSource) -> Result<Acquired> {
        let path = PathBuf::from(&source.input);
        if !path.is_file() {
            return Err(PipelineError::Retrieval(format!(
                "local media file not found: {}",
                path.display()
            )));
        }

        let recording_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| source.input.clone());

        source.resolve(&path, false);
        Ok(Acquired {
            local_path: path,
            recording_id,
            cached: false,
        })
    }
}

/// HTTP fetcher that streams the response body to disk.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, remote_id: &str, dest: &Path) -> anyhow::Result<()> {
        let response = self
            .client
            .get(remote_id)
            .send()
            .await
            .with_context(|| format!("request to {remote_id} failed"))?;

        if !response.status().is_success() {
            anyhow::bail!("download failed with status {}", response.status());
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to open {}", dest.display()))?;

        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("failed to read download chunk")?;
            file.write_all(&chunk)
                .await
                .context("failed to write download chunk")?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if written == 0 {
            warn!("download of {} produced an empty body", remote_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingFetcher {
        calls: AtomicUsize,
        payload: &'static str,
    }

    impl CountingFetcher {
        fn new(payload: &'static str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                payload,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetch for CountingFetcher {
        async fn fetch(&self, _remote_id: &str, dest: &Path) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(dest, self.payload).await?;
            Ok(())
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl Fetch for FailingFetcher {
        async fn fetch(&self, _remote_id: &str, _dest: &Path) -> anyhow::Result<()> {
            anyhow::bail!("permission denied")
        }
    }

    #[tokio::test]
    async fn test_second_acquisition_reuses_cache() {
        let dir = TempDir::new().unwrap();
        let cache = MediaCache::new(dir.path());
        let fetcher = CountingFetcher::new("media-bytes");

        let mut first = RecordingSource::parse("https://host/rec/abc");
        let a = cache.acquire(&mut first, false, &fetcher).await.unwrap();
        assert!(!a.cached);

        let mut second = RecordingSource::parse("https://host/rec/abc");
        let b = cache.acquire(&mut second, false, &fetcher).await.unwrap();
        assert!(b.cached);
        assert!(second.cached);
        assert_eq!(a.local_path, b.local_path);
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_fetches_again() {
        let dir = TempDir::new().unwrap();
        let cache = MediaCache::new(dir.path());
        let fetcher = CountingFetcher::new("media-bytes");

        let mut source = RecordingSource::parse("https://host/rec/abc");
        cache.acquire(&mut source, false, &fetcher).await.unwrap();
        let refreshed = cache.acquire(&mut source, true, &fetcher).await.unwrap();

        assert!(!refreshed.cached);
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_no_entry() {
        let dir = TempDir::new().unwrap();
        let cache = MediaCache::new(dir.path());

        let mut source = RecordingSource::parse("https://host/rec/abc");
        let err = cache.acquire(&mut source, false, &FailingFetcher).await;
        assert!(matches!(err, Err(PipelineError::Retrieval(_))));

        let key = source.cache_key().unwrap();
        assert!(!cache.entry_path(&key).exists());
    }

    #[tokio::test]
    async fn test_concurrent_same_key_downloads_once() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(MediaCache::new(dir.path()));
        let fetcher = Arc::new(CountingFetcher::new("media-bytes"));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            let fetcher = Arc::clone(&fetcher);
            handles.push(tokio::spawn(async move {
                let mut source = RecordingSource::parse("https://host/rec/shared");
                cache.acquire(&mut source, false, fetcher.as_ref()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(fetcher.call_count(), 1);
    }

    struct StalledFetcher;

    #[async_trait]
    impl Fetch for StalledFetcher {
        async fn fetch(&self, _remote_id: &str, _dest: &Path) -> anyhow::Result<()> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_fetch_times_out_as_retrieval_error() {
        let dir = TempDir::new().unwrap();
        let cache =
            MediaCache::new(dir.path()).with_fetch_timeout(std::time::Duration::from_secs(30));

        let mut source = RecordingSource::parse("https://host/rec/slow");
        let err = cache.acquire(&mut source, false, &StalledFetcher).await;
        match err {
            Err(PipelineError::Retrieval(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected retrieval error, got {other:?}"),
        }

        let key = source.cache_key().unwrap();
        assert!(!cache.entry_path(&key).exists());
    }

    #[tokio::test]
    async fn test_local_source_bypasses_cache() {
        let dir = TempDir::new().unwrap();
        let media = dir.path().join("review_2026-08-01.mp4");
        tokio::fs::write(&media, b"frames").await.unwrap();

        let cache = MediaCache::new(dir.path().join("cache"));
        let mut source = RecordingSource::parse(media.to_str().unwrap());
        let acquired = cache
            .acquire(&mut source, false, &FailingFetcher)
            .await
            .unwrap();

        assert_eq!(acquired.recording_id, "review_2026-08-01");
        assert!(!acquired.cached);
        assert!(!cache.root().exists());
    }

    #[tokio::test]
    async fn test_missing_local_file_is_retrieval_error() {
        let dir = TempDir::new().unwrap();
        let cache = MediaCache::new(dir.path());
        let mut source = RecordingSource::parse("/nonexistent/review.mp4");
        let err = cache.acquire(&mut source, false, &FailingFetcher).await;
        assert!(matches!(err, Err(PipelineError::Retrieval(_))));
    }
}
