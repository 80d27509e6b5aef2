//! Package archive reading.
//!
//! A package is a zip (`.pkg`, `.zip`) or gzipped tar (`.tar.gz`, `.tgz`)
//! container holding `manifest.json` plus the per-platform payload files the
//! manifest lists. Readers give random access by entry path; the dispatcher
//! picks the reader from the file name.

mod tar_gz;
mod zip;

use crate::manifest::{MANIFEST_ENTRY, ManifestError, PackageManifest};
use std::path::Path;

pub use tar_gz::TarGzReader;
pub use zip::ZipReader;

/// Trait for format-specific package readers.
pub trait ArchiveReader: Send + Sync {
    /// Check if this reader handles the given archive format.
    fn can_handle(&self, archive_path: &Path) -> bool;

    /// Read one entry's bytes out of the archive.
    fn read_entry(&self, archive_path: &Path, entry: &str) -> Result<Vec<u8>, ManifestError>;
}

/// Dispatcher that selects the appropriate reader based on archive format.
pub struct ArchiveReaderImpl {
    zip: ZipReader,
    tar_gz: TarGzReader,
}

impl Default for ArchiveReaderImpl {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveReaderImpl {
    pub fn new() -> Self {
        Self {
            zip: ZipReader,
            tar_gz: TarGzReader,
        }
    }

    fn reader_for(&self, archive_path: &Path) -> Result<&dyn ArchiveReader, ManifestError> {
        if self.zip.can_handle(archive_path) {
            return Ok(&self.zip);
        }
        if self.tar_gz.can_handle(archive_path) {
            return Ok(&self.tar_gz);
        }
        Err(ManifestError::UnsupportedFormat(
            archive_path.display().to_string(),
        ))
    }

    /// Parse the manifest entry of an archive.
    #[tracing::instrument(skip(self))]
    pub fn read_manifest(&self, archive_path: &Path) -> Result<PackageManifest, ManifestError> {
        let bytes = match self.read_file_bytes(archive_path, MANIFEST_ENTRY) {
            Ok(bytes) => bytes,
            Err(ManifestError::EntryNotFound(_)) => return Err(ManifestError::MissingManifest),
            Err(e) => return Err(e),
        };
        PackageManifest::parse(&bytes)
    }

    /// Read one file out of an archive by its archive-relative path.
    pub fn read_file_bytes(
        &self,
        archive_path: &Path,
        entry: &str,
    ) -> Result<Vec<u8>, ManifestError> {
        self.reader_for(archive_path)?.read_entry(archive_path, entry)
    }
}

impl ArchiveReader for ArchiveReaderImpl {
    fn can_handle(&self, archive_path: &Path) -> bool {
        self.zip.can_handle(archive_path) || self.tar_gz.can_handle(archive_path)
    }

    fn read_entry(&self, archive_path: &Path, entry: &str) -> Result<Vec<u8>, ManifestError> {
        self.reader_for(archive_path)?.read_entry(archive_path, entry)
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    //! Archive builders shared by the unit and integration tests.

    use ::zip::CompressionMethod;
    use ::zip::ZipWriter;
    use ::zip::write::FileOptions;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use tar::Builder;

    pub fn write_zip_package(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = ZipWriter::new(file);
        let options: FileOptions<()> =
            FileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, content) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }

    pub fn write_tar_gz_package(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let enc = GzEncoder::new(file, Compression::default());
        let mut tar = Builder::new(enc);
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(content.len() as u64);
            header.set_cksum();
            tar.append(&header, *content).unwrap();
        }
        tar.finish().unwrap();
    }
}
