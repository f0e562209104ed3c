//! Gzipped tarballs built and unpacked on the host.

use std::fs::File;
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;

use crate::error::{Error, Result};

/// Archive the content of `src_dir` into the gzipped tarball `out`. Paths in
/// the archive are relative to `src_dir`.
pub(crate) fn mk_targz(src_dir: &Path, out: &Path) -> Result<()> {
    debug!("Archiving {} into {}", src_dir.display(), out.display());
    let failed = |e: std::io::Error| {
        Error::Runtime(format!("cannot archive {}: {}", src_dir.display(), e))
    };

    let file = File::create(out).map_err(failed)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    builder.append_dir_all(".", src_dir).map_err(failed)?;
    builder.into_inner().and_then(|gz| gz.finish()).map_err(failed)?;
    Ok(())
}

/// Unpack the gzipped tarball `archive` into `dest`.
pub(crate) fn extract_targz(archive: &Path, dest: &Path) -> Result<()> {
    debug!("Extracting {} into {}", archive.display(), dest.display());
    let failed = |e: std::io::Error| {
        Error::Runtime(format!("cannot extract {}: {}", archive.display(), e))
    };

    let file = File::open(archive).map_err(failed)?;
    let mut tarball = tar::Archive::new(GzDecoder::new(file));
    tarball.set_preserve_permissions(true);
    tarball.unpack(dest).map_err(failed)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn archive_and_unpack_a_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir_all(src.join("etc")).unwrap();
    std::fs::write(src.join("etc/hostname"), "panda01\n").unwrap();

    let tarball = tmp.path().join("root.tgz");
    mk_targz(&src, &tarball).unwrap();

    let dest = tmp.path().join("dest");
    std::fs::create_dir(&dest).unwrap();
    extract_targz(&tarball, &dest).unwrap();
    assert_eq!(
        std::fs::read_to_string(dest.join("etc/hostname")).unwrap(),
        "panda01\n"
    );
}

#[test]
fn extracting_garbage_is_a_runtime_error() {
    let tmp = tempfile::tempdir().unwrap();
    let bogus = tmp.path().join("bogus.tgz");
    std::fs::write(&bogus, b"not a tarball").unwrap();
    let err = extract_targz(&bogus, tmp.path()).unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
}
