//! Host-side helpers: external commands, downloads, archives, serial ports and
//! job working directories.

mod archive;
mod download;
mod ports;
mod system;
mod workspace;

pub(crate) use archive::{extract_targz, mk_targz};
pub use download::{download_with_retry, Downloader, HttpDownloader};
pub(crate) use ports::open_and_setup_port;
pub(crate) use system::{host_command, run_checked, shell_quote};
pub use system::{Shell, ShellOutput, SystemShell};
pub(crate) use workspace::{artifact_url, JobWorkspace};
