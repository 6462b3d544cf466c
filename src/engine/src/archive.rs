//! Portable archive packaging.
//!
//! The create-phase workspace is written out as chunked plain tar files
//! `archive_000001.tar`, `archive_000002.tar`, … each kept under a byte
//! ceiling so the set fits removable media. Only regular files are
//! packaged; entry paths are relative to the workspace.

use std::path::{Path, PathBuf};

use airlift_core::{MirrorError, Result};

/// Chunk file prefix.
pub const ARCHIVE_PREFIX: &str = "archive";

/// Default chunk ceiling when the configuration does not set one.
pub const DEFAULT_SEGMENT_BYTES: u64 = 500 * 1024 * 1024 * 1024;

/// Name of the Nth chunk (1-based).
pub fn chunk_name(index: u64) -> String {
    format!("{ARCHIVE_PREFIX}_{index:06}.tar")
}

/// Writes workspace trees into chunked tar files.
pub struct Packager {
    output_dir: PathBuf,
    segment_bytes: u64,
}

impl Packager {
    pub fn new(output_dir: impl Into<PathBuf>, segment_bytes: Option<u64>) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;
        Ok(Packager {
            output_dir,
            segment_bytes: segment_bytes.unwrap_or(DEFAULT_SEGMENT_BYTES),
        })
    }

    /// Package the given trees. Each tree is rooted at `dir` and its
    /// entries are prefixed with `prefix` inside the archive. Returns the
    /// chunk paths written, in order.
    pub fn pack(&self, trees: &[(PathBuf, String)]) -> Result<Vec<PathBuf>> {
        let mut writer = ChunkWriter::new(&self.output_dir, self.segment_bytes);

        for (dir, prefix) in trees {
            if !dir.exists() {
                tracing::debug!(dir = %dir.display(), "tree absent, skipping");
                continue;
            }
            for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
                let entry = entry.map_err(|e| MirrorError::Archive {
                    path: dir.clone(),
                    message: e.to_string(),
                })?;
                let file_type = entry.file_type();
                if file_type.is_dir() {
                    continue;
                }
                if !file_type.is_file() {
                    // Non-regular entries never enter the archive.
                    tracing::warn!(path = %entry.path().display(), "skipping non-regular file");
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(dir)
                    .map_err(|e| MirrorError::Archive {
                        path: entry.path().to_path_buf(),
                        message: e.to_string(),
                    })?;
                let name = if prefix.is_empty() {
                    rel.to_string_lossy().into_owned()
                } else {
                    format!("{prefix}/{}", rel.to_string_lossy())
                };
                writer.append(entry.path(), &name)?;
            }
        }

        writer.finish()
    }
}

struct ChunkWriter {
    output_dir: PathBuf,
    segment_bytes: u64,
    chunk_index: u64,
    written: u64,
    builder: Option<tar::Builder<std::fs::File>>,
    chunks: Vec<PathBuf>,
}

impl ChunkWriter {
    fn new(output_dir: &Path, segment_bytes: u64) -> Self {
        ChunkWriter {
            output_dir: output_dir.to_path_buf(),
            segment_bytes,
            chunk_index: 0,
            written: 0,
            builder: None,
            chunks: Vec::new(),
        }
    }

    fn open_chunk(&mut self) -> Result<&mut tar::Builder<std::fs::File>> {
        if self.builder.is_none() {
            self.chunk_index += 1;
            self.written = 0;
            let path = self.output_dir.join(chunk_name(self.chunk_index));
            tracing::debug!(chunk = %path.display(), "opening archive chunk");
            let file = std::fs::File::create(&path)?;
            self.chunks.push(path);
            self.builder = Some(tar::Builder::new(file));
        }
        Ok(self.builder.as_mut().expect("chunk just opened"))
    }

    fn append(&mut self, path: &Path, name: &str) -> Result<()> {
        let size = path.metadata()?.len();
        // Roll to a new chunk when this file would overflow the current
        // one; a single oversized file still gets its own chunk.
        if self.builder.is_some() && self.written + size > self.segment_bytes {
            self.roll()?;
        }
        let builder = self.open_chunk()?;
        let mut file = std::fs::File::open(path)?;
        builder.append_file(name, &mut file)?;
        self.written += size;
        Ok(())
    }

    fn roll(&mut self) -> Result<()> {
        if let Some(builder) = self.builder.take() {
            builder.into_inner()?.sync_all()?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<PathBuf>> {
        self.roll()?;
        Ok(self.chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree(dir: &Path, files: &[(&str, usize)]) {
        for (name, size) in files {
            let path = dir.join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, vec![b'x'; *size]).unwrap();
        }
    }

    fn entry_names(chunk: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(std::fs::File::open(chunk).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_chunk_name_format() {
        assert_eq!(chunk_name(1), "archive_000001.tar");
        assert_eq!(chunk_name(42), "archive_000042.tar");
    }

    #[test]
    fn test_pack_single_chunk() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("workspace");
        tree(&src, &[("a.txt", 10), ("sub/b.txt", 20)]);

        let packager = Packager::new(tmp.path().join("out"), None).unwrap();
        let chunks = packager.pack(&[(src, String::new())]).unwrap();
        assert_eq!(chunks.len(), 1);
        let names = entry_names(&chunks[0]);
        assert_eq!(names, vec!["a.txt", "sub/b.txt"]);
    }

    #[test]
    fn test_pack_with_prefix() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("workspace");
        tree(&src, &[("meta.json", 4)]);

        let packager = Packager::new(tmp.path().join("out"), None).unwrap();
        let chunks = packager
            .pack(&[(src, "working-dir".to_string())])
            .unwrap();
        assert_eq!(entry_names(&chunks[0]), vec!["working-dir/meta.json"]);
    }

    #[test]
    fn test_pack_splits_on_ceiling() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("workspace");
        tree(&src, &[("a.bin", 600), ("b.bin", 600), ("c.bin", 600)]);

        let packager = Packager::new(tmp.path().join("out"), Some(1000)).unwrap();
        let chunks = packager.pack(&[(src, String::new())]).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].file_name().unwrap().to_str().unwrap().ends_with("000001.tar"));
        assert!(chunks[2].file_name().unwrap().to_str().unwrap().ends_with("000003.tar"));
        // Every chunk holds exactly one file at this ceiling.
        for chunk in &chunks {
            assert_eq!(entry_names(chunk).len(), 1);
        }
    }

    #[test]
    fn test_pack_skips_missing_tree() {
        let tmp = TempDir::new().unwrap();
        let packager = Packager::new(tmp.path().join("out"), None).unwrap();
        let chunks = packager
            .pack(&[(tmp.path().join("absent"), String::new())])
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_pack_skips_symlinks() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("workspace");
        tree(&src, &[("real.txt", 5)]);
        std::os::unix::fs::symlink(src.join("real.txt"), src.join("link.txt")).unwrap();

        let packager = Packager::new(tmp.path().join("out"), None).unwrap();
        let chunks = packager.pack(&[(src, String::new())]).unwrap();
        assert_eq!(entry_names(&chunks[0]), vec!["real.txt"]);
    }
}
