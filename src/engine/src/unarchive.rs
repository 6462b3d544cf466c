//! Archive extraction on the publish side.
//!
//! Chunks are read sequentially. Every entry is routed by path prefix:
//! working-directory entries unpack under the working dir, cache entries
//! under the cache dir, and anything else is ignored so newer archive
//! layouts extract cleanly on older publishers. Non-regular entries are
//! rejected outright.

use std::io::Read;
use std::path::{Path, PathBuf};

use airlift_core::{MirrorError, Result};

use crate::archive::chunk_name;

/// Prefix of entries belonging to the working directory.
pub const WORKING_DIR_PREFIX: &str = "working-dir";

/// Prefix of entries belonging to the image cache tree.
pub const CACHE_PREFIX: &str = "docker/v2";

/// Where an archive entry unpacks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryRoute {
    WorkingDir,
    Cache,
    /// Unknown prefix: skipped for forward compatibility
    Ignore,
}

/// Route an entry path by its prefix.
pub fn route(path: &str) -> EntryRoute {
    let trimmed = path.trim_start_matches("./");
    if trimmed.starts_with(WORKING_DIR_PREFIX) {
        EntryRoute::WorkingDir
    } else if trimmed.contains(CACHE_PREFIX) {
        EntryRoute::Cache
    } else {
        EntryRoute::Ignore
    }
}

/// Extracts chunked archives into a working dir and cache dir.
pub struct Extractor {
    archive_dir: PathBuf,
    working_dir: PathBuf,
    cache_dir: PathBuf,
}

/// Counters describing one extraction run.
#[derive(Debug, Default, PartialEq)]
pub struct ExtractReport {
    pub chunks: u64,
    pub unpacked: u64,
    pub ignored: u64,
}

impl Extractor {
    pub fn new(
        archive_dir: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Extractor {
            archive_dir: archive_dir.into(),
            working_dir: working_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    /// Extract every chunk in sequence. A missing first chunk means there
    /// is nothing to unpack, which is not an error.
    pub fn extract(&self) -> Result<ExtractReport> {
        std::fs::create_dir_all(&self.working_dir)?;
        std::fs::create_dir_all(&self.cache_dir)?;

        let mut report = ExtractReport::default();
        for index in 1.. {
            let chunk = self.archive_dir.join(chunk_name(index));
            let file = match std::fs::File::open(&chunk) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            };
            tracing::debug!(chunk = %chunk.display(), "extracting archive chunk");
            report.chunks += 1;
            self.extract_chunk(file, &chunk, &mut report)?;
        }
        Ok(report)
    }

    fn extract_chunk(
        &self,
        file: std::fs::File,
        chunk: &Path,
        report: &mut ExtractReport,
    ) -> Result<()> {
        let mut archive = tar::Archive::new(file);
        for entry in archive.entries()? {
            let mut entry = entry.map_err(|e| MirrorError::Archive {
                path: chunk.to_path_buf(),
                message: e.to_string(),
            })?;
            let entry_type = entry.header().entry_type();
            if entry_type.is_dir() {
                continue;
            }
            if !entry_type.is_file() {
                let path = entry.path()?.to_string_lossy().into_owned();
                return Err(MirrorError::Archive {
                    path: chunk.to_path_buf(),
                    message: format!("entry {path} is not a regular file"),
                });
            }

            let name = entry.path()?.to_string_lossy().into_owned();
            let target = match route(&name) {
                EntryRoute::WorkingDir => {
                    // The working-dir prefix maps onto the working dir
                    // itself, not a subdirectory of it.
                    let rel = name
                        .trim_start_matches("./")
                        .trim_start_matches(WORKING_DIR_PREFIX)
                        .trim_start_matches('/');
                    self.working_dir.join(rel)
                }
                EntryRoute::Cache => self.cache_dir.join(name.trim_start_matches("./")),
                EntryRoute::Ignore => {
                    report.ignored += 1;
                    continue;
                }
            };

            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            std::fs::write(&target, data)?;
            report.unpacked += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_chunk(dir: &Path, index: u64, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(dir.join(chunk_name(index))).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn test_route() {
        assert_eq!(route("working-dir/publish/.metadata.json"), EntryRoute::WorkingDir);
        assert_eq!(route("./working-dir/catalogs/index.json"), EntryRoute::WorkingDir);
        assert_eq!(route("docker/v2/example/foo/blobs/sha256:aa"), EntryRoute::Cache);
        assert_eq!(route("imageset-config.yaml"), EntryRoute::Ignore);
        assert_eq!(route("future/unknown-tree/file"), EntryRoute::Ignore);
    }

    #[test]
    fn test_extract_routes_entries() {
        let tmp = TempDir::new().unwrap();
        write_chunk(
            tmp.path(),
            1,
            &[
                ("working-dir/publish/.metadata.json", b"{}"),
                ("docker/v2/a/x/blobs/sha256:aa", b"blob"),
                ("imageset-config.yaml", b"mirror: {}"),
            ],
        );

        let working = tmp.path().join("working");
        let cache = tmp.path().join("cache");
        let extractor = Extractor::new(tmp.path(), &working, &cache);
        let report = extractor.extract().unwrap();

        assert_eq!(report.chunks, 1);
        assert_eq!(report.unpacked, 2);
        assert_eq!(report.ignored, 1);
        assert!(working.join("publish/.metadata.json").is_file());
        assert!(cache.join("docker/v2/a/x/blobs/sha256:aa").is_file());
        assert!(!working.join("imageset-config.yaml").exists());
    }

    #[test]
    fn test_extract_reads_chunks_in_sequence() {
        let tmp = TempDir::new().unwrap();
        write_chunk(tmp.path(), 1, &[("working-dir/a", b"1")]);
        write_chunk(tmp.path(), 2, &[("working-dir/b", b"2")]);
        // A gap: chunk 4 is never read.
        write_chunk(tmp.path(), 4, &[("working-dir/d", b"4")]);

        let working = tmp.path().join("working");
        let extractor = Extractor::new(tmp.path(), &working, tmp.path().join("cache"));
        let report = extractor.extract().unwrap();
        assert_eq!(report.chunks, 2);
        assert!(working.join("a").is_file());
        assert!(working.join("b").is_file());
        assert!(!working.join("d").exists());
    }

    #[test]
    fn test_extract_no_chunks_is_ok() {
        let tmp = TempDir::new().unwrap();
        let extractor = Extractor::new(
            tmp.path(),
            tmp.path().join("working"),
            tmp.path().join("cache"),
        );
        let report = extractor.extract().unwrap();
        assert_eq!(report, ExtractReport::default());
    }

    #[test]
    fn test_extract_rejects_symlink_entries() {
        let tmp = TempDir::new().unwrap();
        let file = std::fs::File::create(tmp.path().join(chunk_name(1))).unwrap();
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_link(&mut header, "working-dir/evil", "/etc/passwd")
            .unwrap();
        builder.finish().unwrap();

        let extractor = Extractor::new(
            tmp.path(),
            tmp.path().join("working"),
            tmp.path().join("cache"),
        );
        let err = extractor.extract().unwrap_err();
        assert!(matches!(err, MirrorError::Archive { .. }));
    }

    #[test]
    fn test_round_trip_with_packager() {
        use crate::archive::Packager;

        let tmp = TempDir::new().unwrap();
        let workspace = tmp.path().join("workspace");
        std::fs::create_dir_all(workspace.join("publish")).unwrap();
        std::fs::write(workspace.join("publish/.metadata.json"), b"{\"uid\":0}").unwrap();
        std::fs::create_dir_all(workspace.join("catalogs/reg/ns/idx/v1")).unwrap();
        std::fs::write(workspace.join("catalogs/reg/ns/idx/v1/index.json"), b"{}").unwrap();

        let out = tmp.path().join("out");
        let packager = Packager::new(&out, None).unwrap();
        packager
            .pack(&[(workspace.clone(), WORKING_DIR_PREFIX.to_string())])
            .unwrap();

        let restored = tmp.path().join("restored");
        let extractor = Extractor::new(&out, &restored, tmp.path().join("cache"));
        extractor.extract().unwrap();

        // Byte-identical round trip of the working tree.
        for rel in ["publish/.metadata.json", "catalogs/reg/ns/idx/v1/index.json"] {
            assert_eq!(
                std::fs::read(workspace.join(rel)).unwrap(),
                std::fs::read(restored.join(rel)).unwrap(),
            );
        }
    }
}
