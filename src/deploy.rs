//! Deploying a hardware pack and a root filesystem on a board.
//!
//! Two strategies exist, chosen by the board family:
//!
//! * **Composed**: the host composes a full disk image out of the hardware
//!   pack and the root filesystem, cuts it into one tarball per partition and
//!   publishes them. The board, booted in its master image, formats its test
//!   partitions and pulls the tarballs into them.
//! * **Chroot**: the board pulls the root filesystem tarball straight onto its
//!   root partition, then installs the kernel package from inside a chroot.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::acquisition::ImageAcquisition;
use crate::board::{Board, DeployStrategy, PartitionKind};
use crate::composer::ImageComposer;
use crate::console::{NetworkCommandRunner, RunOptions};
use crate::error::{Error, Result};
use crate::settings::Settings;
use crate::target::Target;
use crate::utils::{artifact_url, shell_quote, JobWorkspace};

/// Prompt of the deployed system, persisted for the chroot strategy.
const TESTER_PS1: &str = r"linaro-test [rc=$(echo \$?)]# ";

// =============================================================================
// Public Interface
// =============================================================================

/// A kernel package replacing the one of the hardware pack.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KernelOverride {
    /// URL of the `.deb` package.
    pub url: String,
    /// Name prefix of the packages it replaces, e.g. `linux-image`.
    pub package_prefix: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeployRequest {
    pub hwpack: String,
    pub rootfs: String,
    pub kernel: Option<KernelOverride>,
    pub use_cache: bool,
}

/// The URLs a deployment advertised to the board.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Deployed {
    /// The hardware pack used, rewritten when the kernel was replaced. For
    /// the chroot strategy, the kernel package installed.
    pub hwpack_url: String,
    /// Tarball of the boot partition. The chroot strategy has none.
    pub boot_url: Option<String>,
    pub root_url: String,
}

/// Deploy `request` on the board of `target`.
///
/// The board is booted into its master image and left there. Any failure is
/// reported as [`Error::Critical`], keeping the failed operation as its
/// source.
pub fn deploy(target: &mut Target, request: &DeployRequest) -> Result<Deployed> {
    info!("deploying on {}", target.board().hostname);
    info!("  hwpack: {}", request.hwpack);
    info!("  rootfs: {}", request.rootfs);
    if let Some(kernel) = &request.kernel {
        info!("  package: {}", kernel.url);
    }

    match target.board().family.strategy() {
        DeployStrategy::Composed => {
            if let Some(kernel) = &request.kernel {
                check_kernel_package(&kernel.url)?;
            }
            deploy_composed(target, request)
        }
        DeployStrategy::Chroot => {
            check_kernel_package(chroot_kernel(request))?;
            deploy_chroot(target, request)
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn check_kernel_package(url: &str) -> Result<()> {
    if url.rsplit('.').next() != Some("deb") {
        return Err(Error::critical(format!(
            "New kernel only supports deb kernel packages: {}",
            url
        )));
    }
    Ok(())
}

/// The kernel package installed by the chroot strategy.
fn chroot_kernel(request: &DeployRequest) -> &str {
    match &request.kernel {
        Some(kernel) => &kernel.url,
        None => &request.hwpack,
    }
}

// Composed strategy ===========================================================

fn deploy_composed(target: &mut Target, request: &DeployRequest) -> Result<Deployed> {
    let board = target.board().clone();
    let settings = target.settings().clone();
    let acquisition = target.acquisition();
    let mut composer = ImageComposer::new(settings.clone(), target.shell());
    let workspace = JobWorkspace::create(&settings.image_tmpdir)
        .map_err(|e| e.into_critical("Cannot create the working directory"))?;

    let result = target.with_master(|runner, _| {
        format_partitions(runner, &board, &settings)
            .map_err(|e| e.into_critical("Formatting the test partitions failed"))?;
        check_network(runner, &settings)?;

        let mut hwpack_url = request.hwpack.clone();
        if let Some(kernel) = &request.kernel {
            let hwpack = refresh_hwpack(
                &mut composer,
                &acquisition,
                workspace.path(),
                &request.hwpack,
                kernel,
                request.use_cache,
            )
            .and_then(|path| artifact_url(&settings, &path))
            .map_err(|e| e.into_critical("Kernel replacement failed"))?;
            info!("  hwpack with new kernel: {}", hwpack);
            hwpack_url = hwpack;
        }

        info!("About to handle with the build");
        let (boot_tgz, root_tgz) = generate_tarballs(
            &mut composer,
            &acquisition,
            workspace.path(),
            &board,
            &hwpack_url,
            &request.rootfs,
            request.use_cache,
        )
        .map_err(|e| e.into_critical("Deployment tarballs preparation failed"))?;
        let boot_url = artifact_url(&settings, &boot_tgz)
            .map_err(|e| e.into_critical("Deployment tarballs preparation failed"))?;
        let root_url = artifact_url(&settings, &root_tgz)
            .map_err(|e| e.into_critical("Deployment tarballs preparation failed"))?;

        deploy_rootfs(runner, &board, &settings, &root_url)
            .and_then(|_| deploy_bootfs(runner, &board, &settings, &boot_url))
            .map_err(|e| e.into_critical("Deployment failed"))?;

        Ok(Deployed {
            hwpack_url,
            boot_url: Some(boot_url),
            root_url,
        })
    });

    if let Err(e) = workspace.close() {
        warn!("{}", e);
    }
    result
}

fn format_partitions(
    runner: &mut NetworkCommandRunner<'_>,
    board: &Board,
    settings: &Settings,
) -> Result<()> {
    let root = board.partition(PartitionKind::Root);
    let boot = board.partition(PartitionKind::Boot);
    info!("Format {} and {} partitions", boot.label, root.label);
    for partition in [root, boot] {
        runner.run(
            &format!("umount {}", partition.device()),
            RunOptions::new().fail_ok(),
        )?;
        runner.run(
            &partition.mkfs_command(),
            RunOptions::new().timeout(settings.timeouts.format),
        )?;
    }
    Ok(())
}

fn check_network(runner: &mut NetworkCommandRunner<'_>, settings: &Settings) -> Result<()> {
    let server = settings
        .server_address()
        .ok_or_else(|| Error::critical("No server address to check the network with"))?;
    runner
        .wait_network_up(&server, settings.timeouts.network)
        .map_err(|e| e.into_critical("Unable to reach the image server, check network"))
}

/// Replace the kernel of the hardware pack. Returns the new hardware pack.
fn refresh_hwpack(
    composer: &mut ImageComposer,
    acquisition: &ImageAcquisition,
    workdir: &Path,
    hwpack: &str,
    kernel: &KernelOverride,
    use_cache: bool,
) -> Result<PathBuf> {
    info!("Deploying new kernel");
    // Kept apart, the hardware pack is looked up by extension afterwards.
    let dir = workdir.join("kernel");
    fs::create_dir_all(&dir)?;
    let kernel_path = acquisition.acquire(&kernel.url, &dir, use_cache)?;
    let hwpack_path = acquisition.acquire(hwpack, &dir, use_cache)?;
    composer.patch_kernel(&hwpack_path, &kernel_path, &kernel.package_prefix)
}

/// Compose the image and cut it into the boot and root tarballs.
fn generate_tarballs(
    composer: &mut ImageComposer,
    acquisition: &ImageAcquisition,
    workdir: &Path,
    board: &Board,
    hwpack_url: &str,
    rootfs_url: &str,
    use_cache: bool,
) -> Result<(PathBuf, PathBuf)> {
    let hwpack = acquisition.acquire(hwpack_url, workdir, use_cache)?;
    let rootfs = acquisition.acquire(rootfs_url, workdir, use_cache)?;

    let image = composer.compose(&hwpack, &rootfs, board)?;
    let boot_tgz = workdir.join("boot.tgz");
    let root_tgz = workdir.join("root.tgz");
    composer.extract_partition(&image, board.boot_part, &boot_tgz)?;
    composer.extract_partition(&image, board.root_part, &root_tgz)?;
    Ok((boot_tgz, root_tgz))
}

fn deploy_rootfs(
    runner: &mut NetworkCommandRunner<'_>,
    board: &Board,
    settings: &Settings,
    root_url: &str,
) -> Result<()> {
    info!("Deploying linaro image");
    let root = board.partition(PartitionKind::Root);
    runner.run("udevadm trigger", RunOptions::new())?;
    with_mount(runner, &root.device(), root.mount_point, |runner| {
        target_extract(runner, root_url, root.mount_point, settings)?;
        runner.run(
            &format!("echo {} > {}/etc/hostname", board.hostname, root.mount_point),
            RunOptions::new(),
        )?;
        // Packages installed later in the deployed root must never reflash
        // the kernel of the master image.
        runner.run(
            &format!(
                "chroot {} dpkg-divert --local /usr/sbin/flash-kernel",
                root.mount_point
            ),
            RunOptions::new(),
        )?;
        runner.run(
            &format!(
                "chroot {} ln -sf /bin/true /usr/sbin/flash-kernel",
                root.mount_point
            ),
            RunOptions::new(),
        )?;
        Ok(())
    })
}

fn deploy_bootfs(
    runner: &mut NetworkCommandRunner<'_>,
    board: &Board,
    settings: &Settings,
    boot_url: &str,
) -> Result<()> {
    info!("Deploying linaro bootfs");
    let boot = board.partition(PartitionKind::Boot);
    runner.run("udevadm trigger", RunOptions::new())?;
    with_mount(runner, &boot.device(), boot.mount_point, |runner| {
        target_extract(runner, boot_url, boot.mount_point, settings)
    })
}

// Chroot strategy =============================================================

fn deploy_chroot(target: &mut Target, request: &DeployRequest) -> Result<Deployed> {
    let board = target.board().clone();
    let settings = target.settings().clone();
    let kernel_url = chroot_kernel(request).to_owned();

    target.with_master(|runner, _| {
        format_partitions(runner, &board, &settings)
            .map_err(|e| e.into_critical("Formatting the test partitions failed"))?;
        check_network(runner, &settings)?;

        let root = board.partition(PartitionKind::Root);
        let boot = board.partition(PartitionKind::Boot);
        let mnt = root.mount_point;
        let installed = with_mount(runner, &root.device(), mnt, |runner| {
            target_extract(runner, &request.rootfs, mnt, &settings)?;
            runner.run(
                &format!("echo 'export PS1=\"{}\"' >> {}/root/.bashrc", TESTER_PS1, mnt),
                RunOptions::new(),
            )?;
            runner.run(
                &format!("echo '{}' > {}/etc/hostname", board.hostname, mnt),
                RunOptions::new(),
            )?;

            with_mount(runner, &boot.device(), boot.mount_point, |runner| {
                runner.run(
                    &format!("wget -O {}/kernel.deb {}", mnt, kernel_url),
                    RunOptions::new().timeout(settings.timeouts.transfer),
                )?;
                with_pseudo_filesystems(runner, mnt, |runner| {
                    runner.run(
                        &format!("grep -v rootfs /proc/mounts > {}/etc/mtab", mnt),
                        RunOptions::new(),
                    )?;
                    runner.run(
                        &format!("ROOT={} chroot {} dpkg -i kernel.deb", root.device(), mnt),
                        RunOptions::new().timeout(settings.timeouts.transfer),
                    )?;
                    Ok(())
                })?;
                runner.run(&format!("rm {}/kernel.deb", mnt), RunOptions::new())?;
                runner.run("sync", RunOptions::new())?;
                Ok(())
            })
        });
        installed.map_err(|e| e.into_critical("Deployment failed"))?;

        Ok(Deployed {
            hwpack_url: kernel_url.clone(),
            boot_url: None,
            root_url: request.rootfs.clone(),
        })
    })
}

/// Pseudo filesystems bound into the chroot, in mount order, with the
/// commands releasing them.
const PSEUDO_FILESYSTEMS: [(&str, &[&str]); 3] = [
    ("mount --rbind /sys {root}/sys", &["umount {root}/sys"]),
    (
        "mount --rbind /dev {root}/dev",
        &["umount {root}/dev/pts", "umount {root}/dev"],
    ),
    ("mount -t proc none {root}/proc", &["umount {root}/proc"]),
];

/// Run `f` with `/sys`, `/dev` and `/proc` bound under `root`. Whatever got
/// mounted is unmounted in reverse order, whether `f` succeeded or not.
fn with_pseudo_filesystems<T, F>(
    runner: &mut NetworkCommandRunner<'_>,
    root: &str,
    f: F,
) -> Result<T>
where
    F: FnOnce(&mut NetworkCommandRunner<'_>) -> Result<T>,
{
    let mut mounted = Vec::new();
    let mut mounting = Ok(());
    for (mount, unmount) in PSEUDO_FILESYSTEMS.iter() {
        match runner.run(&mount.replace("{root}", root), RunOptions::new()) {
            Ok(_) => mounted.push(*unmount),
            Err(e) => {
                mounting = Err(e);
                break;
            }
        }
    }

    let result = mounting.and_then(|_| f(runner));

    let mut released = Ok(());
    for unmount in mounted.iter().rev() {
        for command in unmount.iter() {
            let command = command.replace("{root}", root);
            match runner.run(&command, RunOptions::new().fail_ok()) {
                Ok(r) if !r.succeeded() => warn!("{:?} exited with {:?}", command, r.exit_code),
                Ok(_) => {}
                Err(e) => {
                    warn!("{}", e);
                    if released.is_ok() {
                        released = Err(e);
                    }
                }
            }
        }
    }

    let value = result?;
    released.map(|_| value)
}

// Shared steps ================================================================

/// Run `f` with `device` mounted on `mount_point`, unmounting it afterwards
/// even when `f` failed.
pub(crate) fn with_mount<T, F>(
    runner: &mut NetworkCommandRunner<'_>,
    device: &str,
    mount_point: &str,
    f: F,
) -> Result<T>
where
    F: FnOnce(&mut NetworkCommandRunner<'_>) -> Result<T>,
{
    runner.run(&format!("mkdir -p {}", mount_point), RunOptions::new())?;
    runner.run(&format!("mount {} {}", device, mount_point), RunOptions::new())?;

    let result = f(runner);
    let unmount = format!("umount {}", mount_point);
    match result {
        Ok(value) => {
            runner.run(&unmount, RunOptions::new())?;
            Ok(value)
        }
        Err(e) => {
            // Best effort, the original failure is what matters.
            if let Err(umount_error) = runner.run(&unmount, RunOptions::new().fail_ok()) {
                warn!("{}", umount_error);
            }
            Err(e)
        }
    }
}

/// Have the board fetch the tarball at `url` and extract it into `dest`.
pub(crate) fn target_extract(
    runner: &mut NetworkCommandRunner<'_>,
    url: &str,
    dest: &str,
    settings: &Settings,
) -> Result<()> {
    let decompress = decompressor(url)?;
    let command = format!(
        "wget -O - {} | {} | tar --warning=no-timestamp --numeric-owner -C {} -xf -",
        shell_quote(url),
        decompress,
        shell_quote(dest)
    );
    let result = runner.run(
        &command,
        RunOptions::new()
            .timeout(settings.timeouts.transfer)
            .fail_ok(),
    )?;
    if !result.succeeded() {
        return Err(Error::OperationFailed(format!(
            "failed to download and extract {} into {} (code {:?})",
            url, dest, result.exit_code
        )));
    }
    Ok(())
}

fn decompressor(url: &str) -> Result<&'static str> {
    if url.ends_with(".gz") || url.ends_with(".tgz") {
        Ok("gunzip -c -")
    } else if url.ends_with(".bz2") {
        Ok("bunzip2 -c -")
    } else {
        Err(Error::Runtime(format!("bad file extension: {}", url)))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Arc;

    use super::*;
    use crate::board::DeviceFamily;
    use crate::console::ConsoleSession;
    use crate::settings::SettingsBuilder;
    use crate::testing::{fast_timeouts, test_board, FakeDownloader, FakeShell, SimBoard};

    struct Fixture {
        sim: SimBoard,
        shell: Arc<FakeShell>,
        downloader: Arc<FakeDownloader>,
        tmpdir: tempfile::TempDir,
        target: Target,
    }

    fn fixture(family: DeviceFamily) -> Fixture {
        let sim = SimBoard::master_image();
        let shell = Arc::new(FakeShell::host());
        let downloader = Arc::new(FakeDownloader::new());
        let tmpdir = tempfile::tempdir().unwrap();
        let board = test_board(family);
        let settings = SettingsBuilder::new()
            .image_tmpdir(tmpdir.path().join("images"))
            .image_url("http://server/images/tmp")
            .cache_dir(tmpdir.path().join("cache"))
            .use_sudo(false)
            .timeouts(fast_timeouts())
            .finalize();
        let session = ConsoleSession::open(&board.hostname, sim.transport()).unwrap();
        let target = Target::new(
            board,
            settings,
            session,
            sim.power(),
            shell.clone(),
            downloader.clone(),
        );
        Fixture {
            sim,
            shell,
            downloader,
            tmpdir,
            target,
        }
    }

    fn request() -> DeployRequest {
        DeployRequest {
            hwpack: "http://snapshots/hwpack_panda_20120530_armel_supported.tar.gz".into(),
            rootfs: "http://snapshots/linaro-precise-nano-20120530.tar.gz".into(),
            kernel: None,
            use_cache: false,
        }
    }

    fn leftover_jobs(fx: &Fixture) -> usize {
        match fs::read_dir(fx.tmpdir.path().join("images")) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    #[test]
    fn composed_deployment() {
        let mut fx = fixture(DeviceFamily::Generic);
        let deployed = deploy(&mut fx.target, &request()).unwrap();

        let boot_url = deployed.boot_url.unwrap();
        assert!(boot_url.starts_with("http://server/images/tmp/job-"));
        assert!(boot_url.ends_with("/boot.tgz"));
        assert!(deployed.root_url.ends_with("/root.tgz"));
        assert_eq!(deployed.hwpack_url, request().hwpack);

        let commands = fx.sim.commands();
        let position = |needle: &str| {
            commands
                .iter()
                .position(|c| c.contains(needle))
                .unwrap_or_else(|| panic!("{:?} never sent", needle))
        };
        let format = position("mkfs.ext3 -q /dev/disk/by-label/testrootfs -L testrootfs");
        position("mkfs.vfat /dev/disk/by-label/testboot -n testboot");
        let ping = position("ping -W4 -c1 server");
        let extract = position(&format!("wget -O - {} | gunzip -c - |", deployed.root_url));
        let divert = position("chroot /mnt/root dpkg-divert --local /usr/sbin/flash-kernel");
        let unmount = position("umount /mnt/root");
        assert!(format < ping && ping < extract && extract < divert && divert < unmount);
        position(&format!("wget -O - {} |", boot_url));

        assert_eq!(leftover_jobs(&fx), 0);
    }

    #[test]
    fn compose_failure_is_critical_and_cleans_up() {
        let mut fx = fixture(DeviceFamily::Generic);
        fx.shell.fail("--image-file", 1, "mkfs failed");
        let err = deploy(&mut fx.target, &request()).unwrap_err();
        assert!(err.is_critical());
        assert_eq!(err.to_string(), "Deployment tarballs preparation failed");
        assert!(matches!(err.root_cause(), Error::Runtime(_)));
        assert_eq!(leftover_jobs(&fx), 0);
    }

    #[test]
    fn formatting_failure_is_critical() {
        for family in &[DeviceFamily::Generic, DeviceFamily::Highbank] {
            let mut fx = fixture(*family);
            fx.sim.on("^mkfs", "mkfs: cannot open device", 1);
            let mut request = request();
            if *family == DeviceFamily::Highbank {
                request.hwpack = "http://builds/linux-image-3.5.0-highbank.deb".into();
            }
            let err = deploy(&mut fx.target, &request).unwrap_err();
            assert!(err.is_critical(), "{:?}", family);
            assert_eq!(err.to_string(), "Formatting the test partitions failed");
            assert!(matches!(err.root_cause(), Error::OperationFailed(_)));
            assert!(fx.downloader.requests().is_empty());
            assert_eq!(leftover_jobs(&fx), 0);
        }
    }

    #[test]
    fn panic_while_composing_removes_the_workspace() {
        let mut fx = fixture(DeviceFamily::Generic);
        fx.shell.on("--image-file", |_| panic!("image tool crashed"));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| deploy(&mut fx.target, &request())));
        assert!(outcome.is_err());
        assert_eq!(leftover_jobs(&fx), 0);
    }

    #[test]
    fn kernel_override_rewrites_the_hwpack_url() {
        let mut fx = fixture(DeviceFamily::Generic);
        let mut request = request();
        request.use_cache = true;
        request.kernel = Some(KernelOverride {
            url: "http://builds/linux-image-3.4.0-1-linaro-omap_3.4.0-1.1_armel.deb".into(),
            package_prefix: "linux-image".into(),
        });

        let deployed = deploy(&mut fx.target, &request).unwrap();
        assert_ne!(deployed.hwpack_url, request.hwpack);
        assert!(deployed
            .hwpack_url
            .starts_with("http://server/images/tmp/job-"));
        assert!(deployed
            .hwpack_url
            .ends_with("/kernel/hwpack_new-kernel_20120601.tar.gz"));

        // The rewritten hardware pack is what got composed.
        let requests = fx.downloader.requests();
        assert!(requests.contains(&(deployed.hwpack_url.clone(), true)));
        assert!(requests.iter().all(|(_, cached)| *cached));
    }

    #[test]
    fn kernel_override_must_be_a_deb() {
        let mut fx = fixture(DeviceFamily::Generic);
        let mut request = request();
        request.kernel = Some(KernelOverride {
            url: "http://builds/zImage".into(),
            package_prefix: "linux-image".into(),
        });
        let err = deploy(&mut fx.target, &request).unwrap_err();
        assert!(err.is_critical());
        assert!(fx.sim.power_events().is_empty());
    }

    #[test]
    fn failed_extraction_unmounts_and_fails() {
        let mut fx = fixture(DeviceFamily::Generic);
        fx.sim.on(r"^wget -O - .*root\.tgz", "wget: server returned error: HTTP/1.1 404", 1);
        let err = deploy(&mut fx.target, &request()).unwrap_err();
        assert_eq!(err.to_string(), "Deployment failed");
        assert!(matches!(err.root_cause(), Error::OperationFailed(_)));

        let commands = fx.sim.commands();
        let wget = commands.iter().position(|c| c.starts_with("wget -O - ")).unwrap();
        assert!(commands[wget..].iter().any(|c| c == "umount /mnt/root"));
        assert_eq!(leftover_jobs(&fx), 0);
    }

    #[test]
    fn unreachable_server_is_critical() {
        let mut fx = fixture(DeviceFamily::Generic);
        fx.sim.on("ping", "1 packets transmitted, 0 packets received", 1);
        let err = deploy(&mut fx.target, &request()).unwrap_err();
        assert!(err.is_critical());
        assert!(err.to_string().contains("check network"));
        // Nothing was built for a board that cannot fetch it.
        assert!(fx.downloader.requests().is_empty());
    }

    #[test]
    fn chroot_deployment_releases_bind_mounts_in_reverse_order() {
        let mut fx = fixture(DeviceFamily::Highbank);
        let mut request = request();
        request.hwpack = "http://builds/linux-image-3.5.0-highbank.deb".into();
        let deployed = deploy(&mut fx.target, &request).unwrap();
        assert_eq!(deployed.boot_url, None);

        let commands = fx.sim.commands();
        let position = |command: &str| {
            commands
                .iter()
                .position(|c| c == command)
                .unwrap_or_else(|| panic!("{:?} never sent", command))
        };
        assert!(commands
            .iter()
            .any(|c| c == "mkfs -t ext4 -q /dev/disk/by-label/rootfs -L rootfs"));
        let sys = position("mount --rbind /sys /mnt/sys");
        let dev = position("mount --rbind /dev /mnt/dev");
        let proc = position("mount -t proc none /mnt/proc");
        let dpkg = position("ROOT=/dev/disk/by-label/rootfs chroot /mnt dpkg -i kernel.deb");
        let uproc = position("umount /mnt/proc");
        let udev = position("umount /mnt/dev");
        let usys = position("umount /mnt/sys");
        assert!(sys < dev && dev < proc && proc < dpkg);
        assert!(dpkg < uproc && uproc < udev && udev < usys);
        assert!(usys < position("umount /mnt/boot"));
        assert!(position("umount /mnt/boot") < position("umount /mnt"));
    }

    #[test]
    fn chroot_failure_still_releases_bind_mounts() {
        let mut fx = fixture(DeviceFamily::Highbank);
        fx.sim.on("dpkg -i", "dpkg: error processing kernel.deb", 1);
        let mut request = request();
        request.hwpack = "http://builds/linux-image-3.5.0-highbank.deb".into();
        let err = deploy(&mut fx.target, &request).unwrap_err();
        assert!(err.is_critical());

        let commands = fx.sim.commands();
        for command in &["umount /mnt/proc", "umount /mnt/dev", "umount /mnt/sys", "umount /mnt"] {
            assert!(commands.iter().any(|c| c == command), "{} never sent", command);
        }
        assert!(!commands.iter().any(|c| c.starts_with("rm /mnt/kernel.deb")));
    }

    #[test]
    fn decompressor_by_extension() {
        assert_eq!(decompressor("http://h/root.tgz").unwrap(), "gunzip -c -");
        assert_eq!(decompressor("http://h/root.tar.bz2").unwrap(), "bunzip2 -c -");
        assert!(matches!(
            decompressor("http://h/root.tar.xz"),
            Err(Error::Runtime(_))
        ));
    }
}
