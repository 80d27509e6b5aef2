use crate::manifest::ManifestError;
use flate2::read::GzDecoder;
use log::debug;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tar::Archive;

use super::ArchiveReader;

/// Reader for gzipped tar packages (`.tar.gz`, `.tgz`).
///
/// Tar has no central directory, so entry lookup is a sequential scan.
pub struct TarGzReader;

impl ArchiveReader for TarGzReader {
    fn can_handle(&self, archive_path: &Path) -> bool {
        let name = archive_path.to_string_lossy().to_lowercase();
        name.ends_with(".tar.gz") || name.ends_with(".tgz")
    }

    fn read_entry(&self, archive_path: &Path, entry: &str) -> Result<Vec<u8>, ManifestError> {
        debug!("Reading '{}' from tar archive {:?}...", entry, archive_path);
        let file = File::open(archive_path)?;
        let mut archive = Archive::new(GzDecoder::new(file));

        let entries = archive
            .entries()
            .map_err(|e| ManifestError::Archive(format!("{}: {e}", archive_path.display())))?;

        for tar_entry in entries {
            let mut tar_entry = tar_entry
                .map_err(|e| ManifestError::Archive(format!("{}: {e}", archive_path.display())))?;
            let path = tar_entry
                .path()
                .map_err(|e| ManifestError::Archive(format!("{}: {e}", archive_path.display())))?;
            if path.to_string_lossy() == entry {
                let mut bytes = Vec::with_capacity(tar_entry.size() as usize);
                tar_entry.read_to_end(&mut bytes)?;
                return Ok(bytes);
            }
        }

        Err(ManifestError::EntryNotFound(entry.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_fixtures::write_tar_gz_package;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_can_handle() {
        let reader = TarGzReader;
        assert!(reader.can_handle(Path::new("a.tar.gz")));
        assert!(reader.can_handle(Path::new("a.tgz")));
        assert!(!reader.can_handle(Path::new("a.pkg")));
    }

    #[test]
    fn test_read_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.tar.gz");
        write_tar_gz_package(&path, &[("manifest.json", b"{}"), ("lib/a.so", b"bytes")]);

        let reader = TarGzReader;
        assert_eq!(reader.read_entry(&path, "lib/a.so").unwrap(), b"bytes");
        assert!(matches!(
            reader.read_entry(&path, "missing").unwrap_err(),
            ManifestError::EntryNotFound(_)
        ));
    }

    #[test]
    fn test_corrupt_archive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.tar.gz");
        std::fs::write(&path, b"not gzip data").unwrap();

        let reader = TarGzReader;
        assert!(reader.read_entry(&path, "manifest.json").is_err());
    }
}
