//! Bootmaster provisions and recovers embedded test boards. It boots a board
//! into a minimal recovery environment (the **master image**) over its
//! console, formats the test partitions, composes a disk image out of a
//! hardware pack and a root filesystem, and has the board pull the result onto
//! its storage before handing it back to the system under test.
//!
//! Everything happens through an interactive shell reached over the board
//! console (a serial port or a spawned connection command such as `telnet`)
//! and an out-of-band power controller (the board management controller or a
//! set of host commands). The console has no structure beyond prompts and
//! whatever the commands print, so each command is followed by a probe
//! recovering its exit status.
//!
//! The boot into the master image is implemented as a state machine, in terms
//! of **states** and **transitions** between them with the following
//! characteristics:
//!
//! * Can only be in one state at any time.
//! * Each state can have its own associated data if needed.
//! * The boot plan (patterns, prompts and timeouts) is shared between **all**
//!   states.
//! * Transitions between states are triggered via typed **events** and follow
//!   defined semantics. Each event carries the console session along.
//! * Only explicitly defined transitions are permitted and as many errors as
//!   possible are detected at **compile-time**.
//! * Transitioning from one state to another consumes the original state.
//!
//! The implementation of state transitions leverages `rust`'s `From` and `Into`
//! pattern: only transitions for which `From<Event>` is implemented exist.
//!
//! Resources acquired on the host or on the board (working directories, loop
//! mounts, partition mounts, bind mounts, the web server of the master image)
//! are always released, whatever the outcome. On the host this relies on
//! `Drop`, on the board on scoped helpers taking a closure.
//!
//! **Example** - Deploying a board described in a configuration file:
//! ```ignore
//! let config = Config::load("/etc/bootmaster.toml")?;
//! let board = config.board("panda01")?.clone();
//! let mut target = Target::connect(board, config.settings.clone())?;
//! let request = DeployRequest {
//!     hwpack: "http://snapshots/hwpack_panda.tar.gz".into(),
//!     rootfs: "http://snapshots/linaro-nano.tar.gz".into(),
//!     kernel: None,
//!     use_cache: true,
//! };
//! deploy(&mut target, &request)?;
//! ```

mod acquisition;
mod board;
mod composer;
mod config;
pub mod console;
mod deploy;
mod error;
mod filesystem;
pub mod master_boot;
pub mod power;
mod settings;
mod target;
mod utils;

#[cfg(test)]
mod testing;

pub use acquisition::ImageAcquisition;
pub use board::{
    Board, ConsoleDescriptor, DeployStrategy, DeviceFamily, Filesystem, MasterImage, Partition,
    PartitionKind, PowerEndpoint,
};
pub use composer::{ImageComposer, PreComposeHook};
pub use config::Config;
pub use deploy::{deploy, DeployRequest, Deployed, KernelOverride};
pub use error::{Error, Result};
pub use filesystem::file_system;
pub use settings::{Settings, SettingsBuilder, Timeouts};
pub use target::Target;
pub use utils::{download_with_retry, Downloader, HttpDownloader, Shell, ShellOutput, SystemShell};
