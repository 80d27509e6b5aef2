use crate::manifest::ManifestError;
use log::debug;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use zip::ZipArchive;
use zip::result::ZipError;

use super::ArchiveReader;

/// Reader for zip-based packages (`.pkg`, `.zip`).
pub struct ZipReader;

impl ArchiveReader for ZipReader {
    fn can_handle(&self, archive_path: &Path) -> bool {
        let name = archive_path.to_string_lossy().to_lowercase();
        name.ends_with(".pkg") || name.ends_with(".zip")
    }

    fn read_entry(&self, archive_path: &Path, entry: &str) -> Result<Vec<u8>, ManifestError> {
        debug!("Reading '{}' from zip archive {:?}...", entry, archive_path);
        let file = File::open(archive_path)?;
        let mut archive = ZipArchive::new(file)
            .map_err(|e| ManifestError::Archive(format!("{}: {e}", archive_path.display())))?;

        let mut zip_entry = match archive.by_name(entry) {
            Ok(f) => f,
            Err(ZipError::FileNotFound) => {
                return Err(ManifestError::EntryNotFound(entry.to_string()));
            }
            Err(e) => {
                return Err(ManifestError::Archive(format!(
                    "{}: {e}",
                    archive_path.display()
                )));
            }
        };

        let mut bytes = Vec::with_capacity(zip_entry.size() as usize);
        zip_entry.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_fixtures::write_zip_package;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_can_handle() {
        let reader = ZipReader;
        assert!(reader.can_handle(Path::new("a.pkg")));
        assert!(reader.can_handle(Path::new("A.ZIP")));
        assert!(!reader.can_handle(Path::new("a.tar.gz")));
    }

    #[test]
    fn test_read_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.pkg");
        write_zip_package(&path, &[("lib/a.so", b"bytes")]);

        let reader = ZipReader;
        assert_eq!(reader.read_entry(&path, "lib/a.so").unwrap(), b"bytes");
        assert!(matches!(
            reader.read_entry(&path, "missing").unwrap_err(),
            ManifestError::EntryNotFound(_)
        ));
    }

    #[test]
    fn test_corrupt_archive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.pkg");
        std::fs::write(&path, b"not a zip archive").unwrap();

        let reader = ZipReader;
        assert!(matches!(
            reader.read_entry(&path, "manifest.json").unwrap_err(),
            ManifestError::Archive(_)
        ));
    }
}
