// Repository archive unpacking, grounded on
// `runner-listener/src/self_updater.rs`'s `extract_archive` (zip vs
// tar.gz dispatch by extension/magic bytes) — repurposed from "unpack a
// runner release" to "unpack a repository-archive ArchiveRegistry result
// into a fresh workspace directory".

use anyhow::{Context, Result};
use std::io::Cursor;
use std::path::Path;

/// Interface the core consumes for repository-archive retrieval (spec.md
/// §1: "Repository-archive fetching (ZIP download/cache); the core
/// consumes an `ArchiveRegistry` interface").
#[async_trait::async_trait]
pub trait ArchiveRegistry: Send + Sync {
    async fn fetch(&self, repo_id: &str, commit: &str, only_path: Option<&str>) -> Result<Vec<u8>>;
}

/// Detect the archive format from its magic bytes and unpack it into
/// `dest_dir`, which must already exist.
pub fn unpack(archive_bytes: &[u8], dest_dir: &Path) -> Result<()> {
    if is_gzip(archive_bytes) {
        let decoder = flate2::read::GzDecoder::new(Cursor::new(archive_bytes));
        let mut archive = tar::Archive::new(decoder);
        archive
            .unpack(dest_dir)
            .context("failed to extract tar.gz archive")?;
        return Ok(());
    }

    if is_zip(archive_bytes) {
        let mut archive = zip::ZipArchive::new(Cursor::new(archive_bytes))
            .context("failed to read zip archive")?;
        archive
            .extract(dest_dir)
            .context("failed to extract zip archive")?;
        return Ok(());
    }

    anyhow::bail!("unrecognized archive format: neither gzip nor zip magic bytes present")
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

fn is_zip(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && &bytes[..4] == b"PK\x03\x04"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn unpacks_zip_archive() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            writer.start_file("a.txt", zip::write::FileOptions::<()>::default()).unwrap();
            writer.write_all(b"hello").unwrap();
            writer.finish().unwrap();
        }
        unpack(&buf, dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "hello");
    }

    #[test]
    fn unpacks_tar_gz_archive() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = Vec::new();
        {
            let encoder = flate2::write::GzEncoder::new(&mut buf, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let data = b"hello";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, "a.txt", &data[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        unpack(&buf, dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "hello");
    }

    #[test]
    fn rejects_unknown_format() {
        assert!(unpack(b"not an archive", Path::new("/tmp")).is_err());
    }
}
