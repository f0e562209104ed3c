//! Fetching the artifacts a deployment needs onto the host.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

use crate::error::Result;
use crate::utils::{download_with_retry, Downloader};

/// Fetches remote artifacts, optionally through the shared cache.
///
/// Writes are atomic: no partially written file is ever visible at a returned
/// path. Failures surface as [`Error::Download`](crate::Error::Download) and
/// are never retried here, use [`ImageAcquisition::acquire_with_retry`] for
/// that.
#[derive(Clone)]
pub struct ImageAcquisition {
    downloader: Arc<dyn Downloader>,
    cache_dir: PathBuf,
}

impl ImageAcquisition {
    pub fn new(downloader: Arc<dyn Downloader>, cache_dir: impl Into<PathBuf>) -> Self {
        ImageAcquisition {
            downloader,
            cache_dir: cache_dir.into(),
        }
    }

    /// Fetch `url` into `dest_dir`. With `use_cache`, the cache keyed by URL
    /// is consulted first and populated on a miss.
    pub fn acquire(&self, url: &str, dest_dir: &Path, use_cache: bool) -> Result<PathBuf> {
        if use_cache {
            info!("Downloading {} using cache", url);
            self.downloader
                .download_with_cache(url, dest_dir, &self.cache_dir)
        } else {
            info!("Downloading {}", url);
            self.downloader.download(url, dest_dir)
        }
    }

    /// Fetch `url` into `dest_dir` without the cache, trying up to `attempts`
    /// times.
    pub fn acquire_with_retry(&self, url: &str, dest_dir: &Path, attempts: usize) -> Result<PathBuf> {
        download_with_retry(self.downloader.as_ref(), url, dest_dir, attempts)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testing::FakeDownloader;

    #[test]
    fn cache_is_used_only_when_asked() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = Arc::new(FakeDownloader::new());
        let acquisition = ImageAcquisition::new(downloader.clone(), tmp.path().join("cache"));

        let path = acquisition
            .acquire("http://snapshots/hwpack.tar.gz", tmp.path(), true)
            .unwrap();
        assert_eq!(path, tmp.path().join("hwpack.tar.gz"));
        acquisition
            .acquire("http://snapshots/rootfs.tgz", tmp.path(), false)
            .unwrap();

        assert_eq!(
            downloader.requests(),
            vec![
                ("http://snapshots/hwpack.tar.gz".to_owned(), true),
                ("http://snapshots/rootfs.tgz".to_owned(), false),
            ]
        );
    }

    #[test]
    fn failures_are_not_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = Arc::new(FakeDownloader::new());
        downloader.fail_on("rootfs");
        let acquisition = ImageAcquisition::new(downloader.clone(), tmp.path());

        let err = acquisition
            .acquire("http://snapshots/rootfs.tgz", tmp.path(), false)
            .unwrap_err();
        assert!(matches!(err, Error::Download { .. }));
        assert_eq!(downloader.requests().len(), 1);
    }
}
