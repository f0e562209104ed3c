//! Per-job working directories under the local artifact root.

use std::fs;
use std::path::{Component, Path};

use log::{debug, info, warn};
use tempfile::TempDir;
use url::Url;

use crate::error::{Error, Result};
use crate::settings::Settings;

/// A private working directory owned by one job.
///
/// It lives under the image tmp dir so that artifacts produced in it can be
/// advertised with [`artifact_url`]. The directory is removed exactly once,
/// either by [`JobWorkspace::close`] or when dropped.
#[derive(Debug)]
pub(crate) struct JobWorkspace {
    dir: Option<TempDir>,
}

impl JobWorkspace {
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix("job-").tempdir_in(root)?;
        // The web server serving the artifacts must be able to read them.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755))?;
        }
        info!("Working directory {}", dir.path().display());
        Ok(JobWorkspace { dir: Some(dir) })
    }

    pub fn path(&self) -> &Path {
        match &self.dir {
            Some(dir) => dir.path(),
            None => Path::new(""),
        }
    }

    /// Remove the directory and everything in it.
    pub fn close(mut self) -> Result<()> {
        match self.dir.take() {
            Some(dir) => {
                debug!("Removing working directory {}", dir.path().display());
                dir.close().map_err(|e| {
                    Error::Runtime(format!("cannot remove working directory: {}", e))
                })
            }
            None => Ok(()),
        }
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_owned();
            if let Err(e) = dir.close() {
                warn!("Cannot remove working directory {}: {}", path.display(), e);
            }
        }
    }
}

/// The URL under which `path` is published. The serving root mirrors the
/// image tmp dir 1:1, so `path` must live under it.
pub(crate) fn artifact_url(settings: &Settings, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(&settings.image_tmpdir).map_err(|_| {
        Error::Runtime(format!(
            "{} is not under {}",
            path.display(),
            settings.image_tmpdir.display()
        ))
    })?;

    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => segments.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(Error::Runtime(format!(
                    "cannot publish {}",
                    relative.display()
                )))
            }
        }
    }

    let mut url = Url::parse(&settings.image_url)
        .map_err(|e| Error::Config(format!("invalid image url {}: {}", settings.image_url, e)))?;
    url.path_segments_mut()
        .map_err(|_| Error::Config(format!("invalid image url {}", settings.image_url)))?
        .pop_if_empty()
        .extend(&segments);
    Ok(url.to_string())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsBuilder;

    #[test]
    fn workspace_is_removed_once() {
        let root = tempfile::tempdir().unwrap();
        let workspace = JobWorkspace::create(root.path()).unwrap();
        let path = workspace.path().to_owned();
        fs::write(path.join("image.img"), b"data").unwrap();
        workspace.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn workspace_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let workspace = JobWorkspace::create(root.path()).unwrap();
            workspace.path().to_owned()
        };
        assert!(!path.exists());
    }

    #[test]
    fn artifact_url_mirrors_tmpdir() {
        let settings = SettingsBuilder::new()
            .image_tmpdir("/var/www/images/tmp")
            .image_url("http://server/images/tmp/")
            .finalize();
        let url = artifact_url(
            &settings,
            Path::new("/var/www/images/tmp/job-x1/boot.tgz"),
        )
        .unwrap();
        assert_eq!(url, "http://server/images/tmp/job-x1/boot.tgz");
    }

    #[test]
    fn artifact_outside_tmpdir_is_rejected() {
        let settings = SettingsBuilder::new()
            .image_tmpdir("/var/www/images/tmp")
            .finalize();
        assert!(artifact_url(&settings, Path::new("/etc/passwd")).is_err());
    }
}
