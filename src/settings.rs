//! Host-side settings shared by every board handled by `bootmaster`.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values.

use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Public Interface
// =============================================================================

/// Timeouts used while driving a board console and the host tools.
///
/// Long operations (formatting, bulk transfer) get their own explicit values,
/// distinct from the default short command timeout.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Timeouts {
    /// Default timeout for a command to bring the prompt back.
    pub command: Duration,
    /// Timeout for the `echo x$?x` exit status probe.
    pub status_probe: Duration,
    /// Timeout for the recovery environment marker after a reset.
    pub boot: Duration,
    /// Timeout for the prompt after overriding `PS1`.
    pub prompt: Duration,
    /// Timeout for formatting the root partition.
    pub format: Duration,
    /// Timeout for fetching and extracting the root tarball on the board.
    pub transfer: Duration,
    /// How long to wait for the master image to reach the server.
    pub network: Duration,
}
impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            command: Duration::from_secs(30),
            status_probe: Duration::from_secs(5),
            boot: Duration::from_secs(300),
            prompt: Duration::from_secs(180),
            format: Duration::from_secs(1800),
            transfer: Duration::from_secs(3600),
            network: Duration::from_secs(300),
        }
    }
}

/// Groups all the host-side settings and acts as a
/// [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
/// for them.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Settings {
    /// Local directory holding job artifacts. Mirrored 1:1 by `image_url`.
    pub image_tmpdir: PathBuf,
    /// Base URL under which the content of `image_tmpdir` is served.
    pub image_url: String,
    /// Shared download cache, keyed by URL.
    pub cache_dir: PathBuf,
    /// Address the master image pings to check its connectivity. When not set,
    /// the host of `image_url` is used.
    pub server_ip: Option<String>,
    /// Prefix privileged host commands (mount, image tools) with `sudo`.
    pub use_sudo: bool,
    /// The image composition tool.
    pub media_create: String,
    /// The hardware pack patching tool.
    pub hwpack_replace: String,
    /// Size of the composed disk image.
    pub image_size: String,
    /// Attempts made by `download_with_retry` before giving up.
    pub download_attempts: usize,
    pub timeouts: Timeouts,

    /// Restrict creation of `Settings` instances unless through the
    /// `SettingsBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}
impl Settings {
    /// The address pinged by the master image to check its connectivity.
    pub fn server_address(&self) -> Option<String> {
        if let Some(ip) = &self.server_ip {
            return Some(ip.clone());
        }
        url::Url::parse(&self.image_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned))
    }
}

/// The builder for the `Settings` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```
/// use bootmaster::SettingsBuilder;
///
/// let settings = SettingsBuilder::new()
///     .image_url("http://10.0.0.1/images/tmp")
///     .finalize();
/// assert_eq!(settings.image_size, "3G");
/// ```
pub struct SettingsBuilder {
    settings: Settings,
}
impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
impl SettingsBuilder {
    /// Start building the settings using default values.
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings {
                image_tmpdir: PathBuf::from("/var/www/images/tmp"),
                image_url: "http://localhost/images/tmp".into(),
                cache_dir: PathBuf::from("/var/cache/bootmaster"),
                server_ip: None,
                use_sudo: true,
                media_create: "linaro-media-create".into(),
                hwpack_replace: "linaro-hwpack-replace".into(),
                image_size: "3G".into(),
                download_attempts: 3,
                timeouts: Timeouts::default(),
                _private_use_builder: (),
            },
        }
    }

    /// Set the local directory holding job artifacts
    pub fn image_tmpdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.settings.image_tmpdir = dir.into();
        self
    }

    /// Set the base URL mirroring the artifact directory
    pub fn image_url<'a>(mut self, url: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.image_url = url.into().as_ref().to_owned();
        self
    }

    /// Set the shared download cache directory
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.settings.cache_dir = dir.into();
        self
    }

    /// Set the address pinged by the master image
    pub fn server_ip<'a>(mut self, ip: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.server_ip = Some(ip.into().as_ref().to_owned());
        self
    }

    /// Enable or disable `sudo` for privileged host commands
    pub fn use_sudo(mut self, use_sudo: bool) -> Self {
        self.settings.use_sudo = use_sudo;
        self
    }

    /// Set the image composition tool
    pub fn media_create<'a>(mut self, tool: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.media_create = tool.into().as_ref().to_owned();
        self
    }

    /// Set the hardware pack patching tool
    pub fn hwpack_replace<'a>(mut self, tool: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.hwpack_replace = tool.into().as_ref().to_owned();
        self
    }

    /// Set the size of the composed image
    pub fn image_size<'a>(mut self, size: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.image_size = size.into().as_ref().to_owned();
        self
    }

    pub fn download_attempts(mut self, attempts: usize) -> Self {
        self.settings.download_attempts = attempts.max(1);
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.settings.timeouts = timeouts;
        self
    }

    pub fn finalize(self) -> Settings {
        self.settings
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn all_default() {
    let settings = SettingsBuilder::new().finalize();
    assert_eq!(
        settings,
        Settings {
            image_tmpdir: PathBuf::from("/var/www/images/tmp"),
            image_url: "http://localhost/images/tmp".into(),
            cache_dir: PathBuf::from("/var/cache/bootmaster"),
            server_ip: None,
            use_sudo: true,
            media_create: "linaro-media-create".into(),
            hwpack_replace: "linaro-hwpack-replace".into(),
            image_size: "3G".into(),
            download_attempts: 3,
            timeouts: Timeouts::default(),
            _private_use_builder: (),
        }
    )
}

#[test]
fn image_url() {
    let settings = SettingsBuilder::new()
        .image_url("http://10.1.1.1/images/tmp")
        .finalize();
    assert_eq!(settings.image_url, "http://10.1.1.1/images/tmp");
}

#[test]
fn server_address_defaults_to_image_host() {
    let settings = SettingsBuilder::new()
        .image_url("http://10.1.1.1/images/tmp")
        .finalize();
    assert_eq!(settings.server_address().as_deref(), Some("10.1.1.1"));

    let settings = SettingsBuilder::new()
        .image_url("http://10.1.1.1/images/tmp")
        .server_ip("192.168.0.2")
        .finalize();
    assert_eq!(settings.server_address().as_deref(), Some("192.168.0.2"));
}

#[test]
fn download_attempts_never_zero() {
    let settings = SettingsBuilder::new().download_attempts(0).finalize();
    assert_eq!(settings.download_attempts, 1);
}

#[test]
fn format_timeout_is_longer_than_commands() {
    let timeouts = Timeouts::default();
    assert!(timeouts.format > timeouts.command);
    assert!(timeouts.transfer > timeouts.command);
}
