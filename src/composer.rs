//! Building the disk image of a deployment on the host and cutting it into
//! per-partition tarballs.
//!
//! All the work is done by external tools (`linaro-media-create`,
//! `linaro-hwpack-replace`, `parted`, `mount`, `tar`) run through a [`Shell`].
//! The methods take `&mut self`: one composer belongs to one job, and the loop
//! mounts of its image are never done concurrently.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use regex::Regex;

use crate::board::{Board, DeviceFamily};
use crate::error::{Error, Result};
use crate::settings::Settings;
use crate::utils::{host_command, run_checked, Shell};

/// Name of the image produced by [`ImageComposer::compose`].
const IMAGE_NAME: &str = "lava.img";

/// Patches a hardware pack in place before composition.
pub type PreComposeHook = Box<dyn Fn(&dyn Shell, &Settings, &Path) -> Result<()> + Send + Sync>;

pub struct ImageComposer {
    settings: Settings,
    shell: Arc<dyn Shell>,
    hooks: Vec<(DeviceFamily, PreComposeHook)>,
}

impl ImageComposer {
    /// A composer with the built-in pre-compose hooks registered.
    pub fn new(settings: Settings, shell: Arc<dyn Shell>) -> Self {
        let mut composer = ImageComposer {
            settings,
            shell,
            hooks: Vec::new(),
        };
        composer.register_hook(DeviceFamily::SnowballSd, Box::new(remove_startupfiles));
        composer
    }

    /// Run `hook` on the hardware pack before composing images for `family`.
    /// Hooks run in registration order.
    pub fn register_hook(&mut self, family: DeviceFamily, hook: PreComposeHook) {
        self.hooks.push((family, hook));
    }

    /// Compose `hwpack` and `rootfs` into a disk image for `board`, next to
    /// the hardware pack.
    pub fn compose(&mut self, hwpack: &Path, rootfs: &Path, board: &Board) -> Result<PathBuf> {
        self.log_tool_version();

        for (family, hook) in &self.hooks {
            if *family == board.family {
                debug!("Running the {:?} pre-compose hook", family);
                hook(self.shell.as_ref(), &self.settings, hwpack)?;
            }
        }

        let image = hwpack
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(IMAGE_NAME);
        let dev = board.media_create_dev();
        let argv = host_command(
            self.settings.use_sudo,
            &[
                &self.settings.media_create,
                "--hwpack-force-yes",
                "--dev",
                &dev,
                "--image-file",
                &path_str(&image),
                "--binary",
                &path_str(rootfs),
                "--hwpack",
                &path_str(hwpack),
                "--image-size",
                &self.settings.image_size,
            ],
        );
        info!("Executing {}", argv.join(" "));
        run_checked(self.shell.as_ref(), &argv, &self.settings.media_create)?;
        Ok(image)
    }

    /// Archive partition `partno` of `image` into the gzipped tarball `out`.
    ///
    /// The partition is loop mounted on a scratch directory for the time of
    /// the archiving. Unmounting is attempted even when archiving failed.
    pub fn extract_partition(&mut self, image: &Path, partno: u32, out: &Path) -> Result<()> {
        let offset = self.partition_offset(image, partno)?;
        let mount_point = tempfile::Builder::new().prefix("bootmaster-mnt").tempdir()?;
        let mnt = path_str(mount_point.path());
        let use_sudo = self.settings.use_sudo;

        let mount = host_command(
            use_sudo,
            &[
                "mount",
                "-o",
                &format!("loop,offset={}", offset),
                &path_str(image),
                &mnt,
            ],
        );
        run_checked(self.shell.as_ref(), &mount, "mount").map_err(|e| {
            Error::Runtime(format!(
                "Unable to mount image {} at offset {}: {}",
                image.display(),
                offset,
                e
            ))
        })?;

        let tar = host_command(use_sudo, &["tar", "-C", &mnt, "-czf", &path_str(out), "."]);
        let archived = run_checked(self.shell.as_ref(), &tar, "tar")
            .map_err(|e| {
                Error::Runtime(format!("Failed to create tarball {}: {}", out.display(), e))
            });

        let umount = host_command(use_sudo, &["umount", &mnt]);
        let unmounted = run_checked(self.shell.as_ref(), &umount, "umount");
        if let Err(e) = &unmounted {
            warn!("{}", e);
            // Still mounted, never clean it up recursively.
            let kept = mount_point.into_path();
            warn!("Leaving {} behind", kept.display());
        }

        archived?;
        unmounted.map(|_| ())
    }

    /// Replace the kernel of `hwpack` with the package `kernel_deb`, removing
    /// the packages named after `prefix`. Returns the new hardware pack, the
    /// old one is deleted.
    pub fn patch_kernel(&mut self, hwpack: &Path, kernel_deb: &Path, prefix: &str) -> Result<PathBuf> {
        info!("Replacing the kernel of {}", hwpack.display());
        let argv = host_command(
            self.settings.use_sudo,
            &[
                &self.settings.hwpack_replace,
                "-t",
                &path_str(hwpack),
                "-p",
                &path_str(kernel_deb),
                "-r",
                prefix,
            ],
        );
        run_checked(self.shell.as_ref(), &argv, &self.settings.hwpack_replace)?;

        // The tool writes the new hardware pack next to the old one and has no
        // option to name it.
        fs::remove_file(hwpack)?;
        let dir = hwpack.parent().unwrap_or_else(|| Path::new("."));
        let mut candidates: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map_or(false, |ext| ext == "gz"))
            .collect();
        candidates.sort();
        candidates.into_iter().next().ok_or_else(|| {
            Error::Runtime(format!(
                "{} did not produce a hardware pack",
                self.settings.hwpack_replace
            ))
        })
    }

    fn log_tool_version(&self) {
        let argv = host_command(self.settings.use_sudo, &[&self.settings.media_create, "-v"]);
        match self.shell.exec(&argv) {
            Ok(out) => info!("{} version: {}", self.settings.media_create, out.output.trim()),
            Err(e) => warn!("Cannot get the {} version: {}", self.settings.media_create, e),
        }
    }

    fn partition_offset(&self, image: &Path, partno: u32) -> Result<u64> {
        let argv: Vec<String> = vec![
            "parted".into(),
            path_str(image),
            "-m".into(),
            "-s".into(),
            "unit".into(),
            "b".into(),
            "print".into(),
        ];
        let table = run_checked(self.shell.as_ref(), &argv, "parted")?;
        parse_partition_offset(&table, partno).ok_or_else(|| {
            Error::Runtime(format!(
                "no partition {} in image {}",
                partno,
                image.display()
            ))
        })
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// Snowball hardware packs carry startup files the SD boards cannot use.
fn remove_startupfiles(shell: &dyn Shell, settings: &Settings, hwpack: &Path) -> Result<()> {
    let argv = host_command(
        settings.use_sudo,
        &[
            &settings.hwpack_replace,
            "-r",
            "startupfiles-v3",
            "-t",
            &path_str(hwpack),
            "-i",
        ],
    );
    run_checked(shell, &argv, &settings.hwpack_replace).map(|_| ())
}

/// Byte offset of partition `partno` in the machine readable output of
/// `parted -m unit b print`.
fn parse_partition_offset(table: &str, partno: u32) -> Option<u64> {
    let pattern = Regex::new(&format!("^{}:([0-9]+)B:", partno)).ok()?;
    table
        .lines()
        .find_map(|line| pattern.captures(line.trim_start()))
        .and_then(|caps| caps.get(1))
        .and_then(|offset| offset.as_str().parse().ok())
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsBuilder;
    use crate::testing::{test_board, FakeShell};

    fn composer(shell: &Arc<FakeShell>) -> ImageComposer {
        let settings = SettingsBuilder::new().use_sudo(false).finalize();
        ImageComposer::new(settings, shell.clone())
    }

    #[test]
    fn offsets_from_parted() {
        let table = "BYT;\n\
            /tmp/lava.img:3221225472B:file:512:512:msdos::;\n\
            1:4194304B:56623103B:52428800B:fat32::boot, lba;\n\
            2:56623104B:3221225471B:3164602368B:ext4::;\n";
        assert_eq!(parse_partition_offset(table, 1), Some(4194304));
        assert_eq!(parse_partition_offset(table, 2), Some(56623104));
        assert_eq!(parse_partition_offset(table, 3), None);
    }

    #[test]
    fn compose_runs_the_hook_of_the_family_only() {
        let tmp = tempfile::tempdir().unwrap();
        let hwpack = tmp.path().join("hwpack.tar.gz");
        let rootfs = tmp.path().join("rootfs.tgz");

        let shell = Arc::new(FakeShell::host());
        let mut composer = composer(&shell);
        let image = composer
            .compose(&hwpack, &rootfs, &test_board(DeviceFamily::Generic))
            .unwrap();
        assert_eq!(image, tmp.path().join("lava.img"));
        assert!(!shell.calls().iter().any(|c| c.contains("startupfiles-v3")));

        let image = composer
            .compose(&hwpack, &rootfs, &test_board(DeviceFamily::SnowballSd))
            .unwrap();
        assert!(image.exists());
        let calls = shell.calls();
        let hook = calls.iter().position(|c| c.contains("startupfiles-v3")).unwrap();
        let compose = calls
            .iter()
            .rposition(|c| c.contains("--dev snowball_sd"))
            .unwrap();
        assert!(hook < compose);
    }

    #[test]
    fn compose_failure_is_a_runtime_error() {
        let tmp = tempfile::tempdir().unwrap();
        let shell = Arc::new(FakeShell::host());
        shell.fail("--image-file", 1, "E: Unable to locate package");
        let err = composer(&shell)
            .compose(
                &tmp.path().join("hwpack.tar.gz"),
                &tmp.path().join("rootfs.tgz"),
                &test_board(DeviceFamily::Generic),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Runtime(ref msg) if msg.contains("Unable to locate")));
    }

    #[test]
    fn extract_partition_mounts_at_the_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("lava.img");
        let out = tmp.path().join("root.tgz");
        let shell = Arc::new(FakeShell::host());
        composer(&shell).extract_partition(&image, 2, &out).unwrap();

        assert!(out.exists());
        let calls = shell.calls();
        assert!(calls
            .iter()
            .any(|c| c.starts_with("mount -o loop,offset=56623104")));
        assert!(calls.last().unwrap().starts_with("umount "));
    }

    #[test]
    fn unmount_is_attempted_when_archiving_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let shell = Arc::new(FakeShell::host());
        shell.fail(r"\btar\b", 2, "tar: short write");
        let err = composer(&shell)
            .extract_partition(&tmp.path().join("lava.img"), 1, &tmp.path().join("boot.tgz"))
            .unwrap_err();
        assert!(matches!(err, Error::Runtime(ref msg)
            if msg.contains("Failed to create tarball") && msg.contains("tar: short write")));
        assert!(shell.calls().last().unwrap().starts_with("umount "));
    }

    #[test]
    fn mount_failure_carries_the_tool_output() {
        let tmp = tempfile::tempdir().unwrap();
        let shell = Arc::new(FakeShell::host());
        shell.fail("^mount ", 32, "mount: /tmp/x: failed to setup loop device");
        let err = composer(&shell)
            .extract_partition(&tmp.path().join("lava.img"), 2, &tmp.path().join("root.tgz"))
            .unwrap_err();
        match err {
            Error::Runtime(msg) => {
                assert!(msg.contains("at offset 56623104"), "{}", msg);
                assert!(msg.contains("failed to setup loop device"), "{}", msg);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!shell.calls().iter().any(|c| c.contains("-czf")));
    }

    #[test]
    fn unknown_partition_fails_before_mounting() {
        let tmp = tempfile::tempdir().unwrap();
        let shell = Arc::new(FakeShell::host());
        let err = composer(&shell)
            .extract_partition(&tmp.path().join("lava.img"), 7, &tmp.path().join("x.tgz"))
            .unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
        assert!(!shell.calls().iter().any(|c| c.starts_with("mount")));
    }

    #[test]
    fn patch_kernel_returns_the_new_hwpack() {
        let tmp = tempfile::tempdir().unwrap();
        let hwpack = tmp.path().join("hwpack_panda_20120530.tar.gz");
        let deb = tmp.path().join("linux-image-3.4.0.deb");
        fs::write(&hwpack, b"old").unwrap();
        fs::write(&deb, b"deb").unwrap();

        let shell = Arc::new(FakeShell::host());
        let new = composer(&shell)
            .patch_kernel(&hwpack, &deb, "linux-image")
            .unwrap();
        assert!(!hwpack.exists());
        assert_eq!(new, tmp.path().join("hwpack_new-kernel_20120601.tar.gz"));
    }
}
