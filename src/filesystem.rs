//! Scoped access to a directory of a target partition, outside of a full
//! deployment.
//!
//! The board, booted in its master image, archives the directory and serves
//! it over HTTP. The host pulls it into a local directory and hands that to
//! the caller. Whatever the caller does, the local directory is then pushed
//! back and replaces the original one on the board.

use std::path::Path;

use log::{info, warn};

use crate::console::{literal_pattern, NetworkCommandRunner, RunOptions};
use crate::deploy::{target_extract, with_mount};
use crate::error::{Error, Result};
use crate::settings::Settings;
use crate::target::Target;
use crate::utils::{artifact_url, extract_targz, mk_targz, shell_quote, JobWorkspace};

/// Where the partition is mounted under the master image.
const MOUNT_POINT: &str = "/mnt";
/// Directory served by the web server of the master image.
const SERVED_DIR: &str = "/tmp";
const SERVED_ARCHIVE: &str = "fs.tgz";

/// Give `f` a local copy of `path` inside partition `partition` of the board.
///
/// `path` is relative to the partition root and is created when missing. The
/// partition root itself is never handed out. Once `f` returns, the local
/// copy replaces the directory on the board, even when `f` failed.
///
/// **Example**
///
/// ```ignore
/// let logs = filesystem::file_system(&mut target, 2, "/var/log/lava", |dir| {
///     Ok(fs::read_dir(dir)?.count())
/// })?;
/// ```
pub fn file_system<T, F>(target: &mut Target, partition: u32, path: &str, f: F) -> Result<T>
where
    F: FnOnce(&Path) -> Result<T>,
{
    let (parent, name) = split_target_path(path)?;
    let partition = target.board().partition_by_number(partition)?;
    let settings = target.settings().clone();
    let acquisition = target.acquisition();
    let workspace = JobWorkspace::create(&settings.image_tmpdir)?;
    info!(
        "Accessing {} on partition {} of {}",
        path,
        partition.number,
        target.board().hostname
    );

    let result = target.with_master(|runner, env| {
        with_mount(runner, &partition.device(), MOUNT_POINT, |runner| {
            let board_dir = format!("{}/{}", parent, name);
            runner.run(&format!("mkdir -p {}", shell_quote(&board_dir)), RunOptions::new())?;
            runner.run(
                &format!(
                    "tar -czf {}/{} -C {} {}",
                    SERVED_DIR,
                    SERVED_ARCHIVE,
                    shell_quote(&parent),
                    shell_quote(name)
                ),
                RunOptions::new().timeout(settings.timeouts.transfer),
            )?;

            with_web_server(runner, |runner| {
                let url = format!("http://{}/{}", env.ip, SERVED_ARCHIVE);
                let tarball = acquisition.acquire_with_retry(
                    &url,
                    workspace.path(),
                    settings.download_attempts,
                )?;
                let local = workspace.path().join("fs");
                extract_targz(&tarball, &local)?;

                let result = f(&local.join(name));

                info!("Pushing {} back to the board", board_dir);
                let pushed = workspace_url(&local, workspace.path(), &settings).and_then(|url| {
                    runner.run(&format!("rm -rf {}", shell_quote(&board_dir)), RunOptions::new())?;
                    target_extract(runner, &url, &parent, &settings)
                });
                match (result, pushed) {
                    (Ok(value), pushed) => pushed.map(|_| value),
                    (Err(e), pushed) => {
                        if let Err(push_error) = pushed {
                            warn!("{}", push_error);
                        }
                        Err(e)
                    }
                }
            })
        })
    });

    if let Err(e) = workspace.close() {
        warn!("{}", e);
    }
    result
}

/// Split `path` into the parent directory on the board and the name of the
/// directory. The partition root is rejected.
fn split_target_path(path: &str) -> Result<(String, &str)> {
    let relative = path.trim_matches('/');
    if relative.is_empty() {
        return Err(Error::InvalidRequest(format!(
            "cannot access the partition root ({:?})",
            path
        )));
    }
    if relative.split('/').any(|c| c == "..") {
        return Err(Error::InvalidRequest(format!(
            "{:?} escapes the partition",
            path
        )));
    }
    Ok(match relative.rsplit_once('/') {
        Some((dir, name)) => (format!("{}/{}", MOUNT_POINT, dir), name),
        None => (MOUNT_POINT.to_owned(), relative),
    })
}

/// Archive `local` in the workspace and return the URL it is published at.
fn workspace_url(local: &Path, workspace: &Path, settings: &Settings) -> Result<String> {
    let archive = workspace.join("fs-modified.tgz");
    mk_targz(local, &archive)?;
    artifact_url(settings, &archive)
}

/// Run `f` while the master image serves [`SERVED_DIR`] over HTTP. The web
/// server is stopped and the served archive removed afterwards.
fn with_web_server<T, F>(runner: &mut NetworkCommandRunner<'_>, f: F) -> Result<T>
where
    F: FnOnce(&mut NetworkCommandRunner<'_>) -> Result<T>,
{
    let started = runner.run(
        &format!("busybox httpd -f -p 80 -h {} & echo pid=$!", SERVED_DIR),
        RunOptions::new().response(literal_pattern(r"pid=([0-9]+)")),
    )?;
    let pid = match started.matched().and_then(|c| c.group(1)) {
        Some(pid) => pid.to_owned(),
        None => return Err(Error::critical("Unable to start the web server of the master image")),
    };
    info!("Web server started with pid {}", pid);

    let result = f(runner);

    for command in &[
        format!("kill {}", pid),
        format!("rm -f {}/{}", SERVED_DIR, SERVED_ARCHIVE),
    ] {
        if let Err(e) = runner.run(command, RunOptions::new().fail_ok()) {
            warn!("{}", e);
        }
    }
    result
}

// =============================================================================
// Unit Tests
// =============================================================================
