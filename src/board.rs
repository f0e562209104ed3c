//! Static identity of a board: how to reach its console, how to power it, and
//! how its storage is laid out.
//!
//! Boards are created from the configuration file at startup and never change
//! afterwards.

use serde::Deserialize;

use crate::error::{Error, Result};

// =============================================================================
// Public Interface
// =============================================================================

/// The board families `bootmaster` knows how to provision.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceFamily {
    /// Boards with `testboot`/`testrootfs` partitions next to the master image.
    Generic,
    /// Same layout as `Generic`, but the hardware pack startup files must be
    /// removed before composing the image.
    SnowballSd,
    /// Server nodes booted into the master image over PXE, installing their
    /// kernel package inside a chroot.
    Highbank,
}

/// How a family gets its root filesystem onto the target partitions.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeployStrategy {
    /// Compose an image on the host, split it into boot/root tarballs and let
    /// the board fetch and extract them.
    Composed,
    /// Extract the root tarball straight under the master root and install the
    /// kernel package inside a chroot.
    Chroot,
}

impl DeviceFamily {
    pub fn strategy(self) -> DeployStrategy {
        match self {
            DeviceFamily::Generic | DeviceFamily::SnowballSd => DeployStrategy::Composed,
            DeviceFamily::Highbank => DeployStrategy::Chroot,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PartitionKind {
    Boot,
    Root,
}

/// Filesystem types used when formatting the target partitions.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Filesystem {
    Vfat,
    Ext2,
    Ext3,
    Ext4,
}

/// A target partition, resolved for a given board.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Partition {
    pub kind: PartitionKind,
    /// Partition number inside the composed image.
    pub number: u32,
    pub label: &'static str,
    pub filesystem: Filesystem,
    /// Where the partition is mounted under the master image.
    pub mount_point: &'static str,
}

impl Partition {
    /// The device node of the partition under the master image.
    pub fn device(&self) -> String {
        format!("/dev/disk/by-label/{}", self.label)
    }

    /// The shell command formatting this partition, keeping its label.
    pub fn mkfs_command(&self) -> String {
        let device = self.device();
        match self.filesystem {
            Filesystem::Vfat => format!("mkfs.vfat {} -n {}", device, self.label),
            Filesystem::Ext3 => format!("mkfs.ext3 -q {} -L {}", device, self.label),
            Filesystem::Ext2 => format!("mkfs -t ext2 -q {} -L {}", device, self.label),
            Filesystem::Ext4 => format!("mkfs -t ext4 -q {} -L {}", device, self.label),
        }
    }
}

/// How to reach the board console.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum ConsoleDescriptor {
    /// Spawn a command connected to the console (`telnet`, `conmux-console`...).
    Command { command: String },
    /// Open a serial device directly.
    Serial {
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
}

/// Out-of-band power and boot device control endpoint.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum PowerEndpoint {
    /// The board management controller, driven with `ipmitool`.
    Ipmi {
        host: String,
        #[serde(default = "default_ipmi_credential")]
        user: String,
        #[serde(default = "default_ipmi_credential")]
        password: String,
    },
    /// Shell commands run on the host (PDU scripts and the like).
    Commands {
        on: String,
        off: String,
        reset: String,
        #[serde(default)]
        boot_disk: Option<String>,
        #[serde(default)]
        boot_network: Option<String>,
    },
}

/// Conventions of the master (recovery) image booted on the board.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct MasterImage {
    /// Regular expression printed once the recovery environment is up.
    pub marker: String,
    /// Literal shell prompt forced once the shell is reached.
    pub prompt: String,
    /// Network interface brought up in the master image.
    pub interface: String,
}
impl Default for MasterImage {
    fn default() -> Self {
        MasterImage {
            marker: r"\(initramfs\)".into(),
            prompt: "root@master# ".into(),
            interface: "eth0".into(),
        }
    }
}

/// A board under test.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct Board {
    pub hostname: String,
    pub family: DeviceFamily,
    pub console: ConsoleDescriptor,
    pub power: PowerEndpoint,
    #[serde(default = "default_boot_part")]
    pub boot_part: u32,
    #[serde(default = "default_root_part")]
    pub root_part: u32,
    /// The `--dev` argument handed to the image composition tool.
    #[serde(default)]
    pub lmc_dev: Option<String>,
    #[serde(default)]
    pub master: MasterImage,
}

impl Board {
    /// Resolve one of the target partitions for this board family.
    pub fn partition(&self, kind: PartitionKind) -> Partition {
        let number = match kind {
            PartitionKind::Boot => self.boot_part,
            PartitionKind::Root => self.root_part,
        };
        let (label, filesystem, mount_point) = match (self.family, kind) {
            (DeviceFamily::Generic, PartitionKind::Boot)
            | (DeviceFamily::SnowballSd, PartitionKind::Boot) => {
                ("testboot", Filesystem::Vfat, "/mnt/boot")
            }
            (DeviceFamily::Generic, PartitionKind::Root)
            | (DeviceFamily::SnowballSd, PartitionKind::Root) => {
                ("testrootfs", Filesystem::Ext3, "/mnt/root")
            }
            (DeviceFamily::Highbank, PartitionKind::Boot) => ("boot", Filesystem::Ext2, "/mnt/boot"),
            (DeviceFamily::Highbank, PartitionKind::Root) => ("rootfs", Filesystem::Ext4, "/mnt"),
        };
        Partition {
            kind,
            number,
            label,
            filesystem,
            mount_point,
        }
    }

    /// Resolve a partition from its number. Numbers other than the configured
    /// boot and root partitions are rejected.
    pub fn partition_by_number(&self, number: u32) -> Result<Partition> {
        if number == self.boot_part {
            Ok(self.partition(PartitionKind::Boot))
        } else if number == self.root_part {
            Ok(self.partition(PartitionKind::Root))
        } else {
            Err(Error::InvalidRequest(format!(
                "partition {} is neither the boot ({}) nor the root ({}) partition of {}",
                number, self.boot_part, self.root_part, self.hostname
            )))
        }
    }

    /// The `--dev` argument for the image composition tool, defaulting to the
    /// family name.
    pub fn media_create_dev(&self) -> String {
        match &self.lmc_dev {
            Some(dev) => dev.clone(),
            None => match self.family {
                DeviceFamily::Generic => "generic".into(),
                DeviceFamily::SnowballSd => "snowball_sd".into(),
                DeviceFamily::Highbank => "highbank".into(),
            },
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn default_baud_rate() -> u32 {
    115_200
}

fn default_ipmi_credential() -> String {
    "admin".into()
}

fn default_boot_part() -> u32 {
    1
}

fn default_root_part() -> u32 {
    2
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
fn board(family: DeviceFamily) -> Board {
    Board {
        hostname: "panda01".into(),
        family,
        console: ConsoleDescriptor::Command {
            command: "telnet localhost 7001".into(),
        },
        power: PowerEndpoint::Ipmi {
            host: "10.0.0.5".into(),
            user: "admin".into(),
            password: "admin".into(),
        },
        boot_part: 1,
        root_part: 2,
        lmc_dev: None,
        master: MasterImage::default(),
    }
}

#[test]
fn generic_partitions_use_test_labels() {
    let b = board(DeviceFamily::Generic);
    let root = b.partition(PartitionKind::Root);
    assert_eq!(root.device(), "/dev/disk/by-label/testrootfs");
    assert_eq!(
        root.mkfs_command(),
        "mkfs.ext3 -q /dev/disk/by-label/testrootfs -L testrootfs"
    );
    let boot = b.partition(PartitionKind::Boot);
    assert_eq!(
        boot.mkfs_command(),
        "mkfs.vfat /dev/disk/by-label/testboot -n testboot"
    );
}

#[test]
fn highbank_partitions() {
    let b = board(DeviceFamily::Highbank);
    assert_eq!(b.family.strategy(), DeployStrategy::Chroot);
    let root = b.partition(PartitionKind::Root);
    assert_eq!(root.mount_point, "/mnt");
    assert_eq!(
        root.mkfs_command(),
        "mkfs -t ext4 -q /dev/disk/by-label/rootfs -L rootfs"
    );
}

#[test]
fn unknown_partition_number_is_rejected() {
    let b = board(DeviceFamily::Generic);
    assert_eq!(b.partition_by_number(2).unwrap().kind, PartitionKind::Root);
    assert!(matches!(
        b.partition_by_number(5),
        Err(Error::InvalidRequest(_))
    ));
}

#[test]
fn media_create_dev_defaults_to_family() {
    let mut b = board(DeviceFamily::SnowballSd);
    assert_eq!(b.media_create_dev(), "snowball_sd");
    b.lmc_dev = Some("panda".into());
    assert_eq!(b.media_create_dev(), "panda");
}
