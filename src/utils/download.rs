//! Fetching remote artifacts to the host.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use tempfile::NamedTempFile;
use url::{form_urlencoded, Url};

use crate::error::{Error, Result};

/// Delay between two attempts of [`download_with_retry`].
const RETRY_DELAY_MS: u64 = 1000;

/// Fetches artifacts into local directories.
///
/// Implementations write atomically: the returned path never exposes a
/// partially written file. They never retry on their own.
pub trait Downloader: Send + Sync {
    /// Fetch `url` into `dest_dir`, keeping its file name.
    fn download(&self, url: &str, dest_dir: &Path) -> Result<PathBuf>;

    /// Like `download` but reuse the copy kept in `cache_dir` when there is
    /// one, populating the cache otherwise.
    fn download_with_cache(&self, url: &str, dest_dir: &Path, cache_dir: &Path)
        -> Result<PathBuf>;
}

/// Fetch `url`, trying at most `attempts` times with a fixed delay between
/// attempts.
pub fn download_with_retry(
    downloader: &dyn Downloader,
    url: &str,
    dest_dir: &Path,
    attempts: usize,
) -> Result<PathBuf> {
    use retry::{delay, retry_with_index};

    let result = retry_with_index(
        delay::Fixed::from_millis(RETRY_DELAY_MS).take(attempts.saturating_sub(1)),
        |index| {
            debug!("Downloading {} (attempt {})", url, index);
            downloader.download(url, dest_dir)
        },
    );
    match result {
        Ok(path) => Ok(path),
        Err(retry::Error::Operation {
            error,
            total_delay,
            tries,
        }) => {
            warn!(
                "Failed to download {} after {:?} and {} tries: {}",
                url, total_delay, tries, error
            );
            Err(error)
        }
        Err(retry::Error::Internal(reason)) => Err(Error::Download {
            url: url.to_owned(),
            reason,
        }),
    }
}

// HttpDownloader ==============================================================

/// Downloads over HTTP(S), and copies `file://` URLs and plain paths.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::blocking::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Runtime(format!("cannot create the HTTP client: {}", e)))?;
        Ok(HttpDownloader { client })
    }

    fn fetch_into(&self, url: &str, file: &mut File) -> Result<()> {
        let failed = |reason: String| Error::Download {
            url: url.to_owned(),
            reason,
        };

        match Url::parse(url) {
            Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => {
                let response = self
                    .client
                    .get(parsed)
                    .send()
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| failed(e.to_string()))?;

                let pb = match response.content_length() {
                    Some(len) => ProgressBar::new(len),
                    None => ProgressBar::new_spinner(),
                };
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("[BM] {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
                        .progress_chars("=> "),
                );
                pb.set_message(file_name(url).unwrap_or_default());
                io::copy(&mut pb.wrap_read(response), file).map_err(|e| failed(e.to_string()))?;
                pb.finish_and_clear();
                Ok(())
            }
            Ok(parsed) if parsed.scheme() == "file" => {
                let path = parsed
                    .to_file_path()
                    .map_err(|_| failed("not a local path".into()))?;
                copy_into(&path, file).map_err(|e| failed(e.to_string()))
            }
            Ok(parsed) => Err(failed(format!("unsupported scheme {}", parsed.scheme()))),
            // Not a URL, a local path
            Err(_) => copy_into(Path::new(url), file).map_err(|e| failed(e.to_string())),
        }
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &str, dest_dir: &Path) -> Result<PathBuf> {
        let name = file_name(url).ok_or_else(|| Error::Download {
            url: url.to_owned(),
            reason: "no file name in url".into(),
        })?;
        let dest = dest_dir.join(name);
        info!("Downloading {} to {}", url, dest.display());

        let mut tmp = NamedTempFile::new_in(dest_dir).map_err(storage_failed(url))?;
        self.fetch_into(url, tmp.as_file_mut())?;
        persist(tmp, &dest, url)?;
        Ok(dest)
    }

    fn download_with_cache(
        &self,
        url: &str,
        dest_dir: &Path,
        cache_dir: &Path,
    ) -> Result<PathBuf> {
        let cached = cache_path(url, cache_dir).ok_or_else(|| Error::Download {
            url: url.to_owned(),
            reason: "cannot be cached".into(),
        })?;

        if cached.is_file() {
            debug!("Cache hit for {}: {}", url, cached.display());
        } else {
            let cache_subdir = cached.parent().unwrap_or(cache_dir);
            fs::create_dir_all(cache_subdir).map_err(storage_failed(url))?;
            self.download(url, cache_subdir)?;
        }

        let dest = dest_dir.join(cached.file_name().unwrap_or_default());
        let mut tmp = NamedTempFile::new_in(dest_dir).map_err(storage_failed(url))?;
        copy_into(&cached, tmp.as_file_mut()).map_err(storage_failed(url))?;
        persist(tmp, &dest, url)?;
        Ok(dest)
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// Last non-empty path segment of `url`.
fn file_name(url: &str) -> Option<String> {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_owned(),
        Err(_) => url.to_owned(),
    };
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(str::to_owned)
}

/// Where the cached copy of `url` lives:
/// `<cache_dir>/<host>[_<port>]/<dirs>[/query=<query>]/<name>`.
///
/// The port and the query are part of the key, only the file name is kept
/// as is.
fn cache_path(url: &str, cache_dir: &Path) -> Option<PathBuf> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str().unwrap_or("local");
    let mut path = match parsed.port() {
        Some(port) => cache_dir.join(format!("{}_{}", host, port)),
        None => cache_dir.join(host),
    };

    let segments: Vec<&str> = parsed
        .path_segments()?
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .collect();
    let (name, dirs) = segments.split_last()?;
    path.extend(dirs);
    if let Some(query) = parsed.query() {
        let query: String = form_urlencoded::byte_serialize(query.as_bytes()).collect();
        path.push(format!("query={}", query));
    }
    path.push(name);
    Some(path)
}

fn copy_into(src: &Path, file: &mut File) -> io::Result<()> {
    let mut src = File::open(src)?;
    io::copy(&mut src, file).map(|_| ())
}

fn storage_failed(url: &str) -> impl Fn(io::Error) -> Error + '_ {
    move |e| Error::Download {
        url: url.to_owned(),
        reason: e.to_string(),
    }
}

fn persist(tmp: NamedTempFile, dest: &Path, url: &str) -> Result<()> {
    tmp.persist(dest).map(|_| ()).map_err(|e| Error::Download {
        url: url.to_owned(),
        reason: e.error.to_string(),
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
