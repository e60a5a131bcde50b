//! Atomic replacement of the published snapshot file.
//!
//! Bytes are written to a uniquely named temporary file in the output file's
//! directory, synced, then renamed over the output file. Readers see either
//! the previous document or the new one, never a mix.

use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::PublishError;

// Length of the random part tempfile puts between prefix and suffix.
const TEMP_RAND_LEN: usize = 6;

/// Destination of serialised snapshots.
pub trait SnapshotSink: Send + Sync + 'static {
    /// Replaces the target with `bytes`, returning the number of bytes written.
    fn publish(&self, bytes: &[u8]) -> Result<u64, PublishError>;

    fn target(&self) -> &Path;
}

#[derive(Debug, Clone)]
pub struct AtomicFilePublisher {
    output: PathBuf,
    dir: PathBuf,
    temp_prefix: OsString,
    temp_suffix: OsString,
}

impl AtomicFilePublisher {
    /// Only the file name of `temp_file` is used; the temporary always lives
    /// next to `output` so the rename never crosses a filesystem.
    ///
    /// Temporaries left behind by a previous process are removed here.
    pub fn new(output: impl Into<PathBuf>, temp_file: impl AsRef<Path>) -> Self {
        let output = output.into();
        let dir = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let temp_file = temp_file.as_ref();
        let mut temp_prefix = temp_file
            .file_stem()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("tmp"));
        temp_prefix.push(".");
        let temp_suffix = match temp_file.extension() {
            Some(ext) => {
                let mut suffix = OsString::from(".");
                suffix.push(ext);
                suffix
            }
            None => OsString::new(),
        };

        let publisher = Self {
            output,
            dir,
            temp_prefix,
            temp_suffix,
        };
        match publisher.remove_stale_temporaries() {
            Ok(0) => {}
            Ok(removed) => info!(dir = %publisher.dir.display(), removed, "removed stale snapshot temporaries"),
            Err(err) => warn!(dir = %publisher.dir.display(), error = %err, "failed to scan for stale snapshot temporaries"),
        }
        publisher
    }

    /// Deletes files in the output directory named like one of our temporaries.
    pub fn remove_stale_temporaries(&self) -> io::Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() || !self.is_temporary_name(&entry.file_name()) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "failed to remove stale temporary")
                }
            }
        }
        Ok(removed)
    }

    fn is_temporary_name(&self, name: &OsStr) -> bool {
        if Some(name) == self.output.file_name() {
            return false;
        }
        let (Some(name), Some(prefix), Some(suffix)) =
            (name.to_str(), self.temp_prefix.to_str(), self.temp_suffix.to_str())
        else {
            return false;
        };
        name.strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(suffix))
            .is_some_and(|middle| {
                middle.len() == TEMP_RAND_LEN && middle.bytes().all(|b| b.is_ascii_alphanumeric())
            })
    }

    /// Writes and syncs `bytes` into a fresh temporary file without touching the output.
    pub fn stage(&self, bytes: &[u8]) -> Result<StagedSnapshot, PublishError> {
        let mut file = tempfile::Builder::new()
            .prefix(&self.temp_prefix)
            .suffix(&self.temp_suffix)
            .tempfile_in(&self.dir)
            .map_err(|e| PublishError::staging(self.dir.clone(), e))?;

        // On error `file` is dropped here, which removes the temporary.
        let temp_path = file.path().to_path_buf();
        file.write_all(bytes)
            .and_then(|()| file.flush())
            .and_then(|()| file.as_file().sync_all())
            .map_err(|e| PublishError::staging(temp_path, e))?;

        debug!(temp_path = %file.path().display(), bytes = bytes.len(), "staged snapshot");
        Ok(StagedSnapshot {
            file,
            target: self.output.clone(),
            dir: self.dir.clone(),
            len: bytes.len() as u64,
        })
    }
}

impl SnapshotSink for AtomicFilePublisher {
    fn publish(&self, bytes: &[u8]) -> Result<u64, PublishError> {
        self.stage(bytes)?.commit()
    }

    fn target(&self) -> &Path {
        &self.output
    }
}

/// A fully written temporary file. Dropping it without `commit` deletes it and
/// leaves the output untouched.
#[derive(Debug)]
pub struct StagedSnapshot {
    file: NamedTempFile,
    target: PathBuf,
    dir: PathBuf,
    len: u64,
}

impl StagedSnapshot {
    pub fn temp_path(&self) -> &Path {
        self.file.path()
    }

    /// Renames the temporary over the output file.
    pub fn commit(self) -> Result<u64, PublishError> {
        let StagedSnapshot {
            file,
            target,
            dir,
            len,
        } = self;

        // PersistError hands the temporary back; dropping it removes the file.
        file.persist(&target)
            .map_err(|e| PublishError::rename(target.clone(), e.error))?;

        if let Err(err) = sync_directory(&dir) {
            warn!(dir = %dir.display(), error = %err, "failed to sync output directory");
        }
        Ok(len)
    }
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::error::FailureKind;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn publish_creates_and_replaces_output() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("network-info.json");
        let publisher = AtomicFilePublisher::new(&output, "tmp.json");

        assert_eq!(publisher.publish(b"{\"num_networks\":0}").unwrap(), 18);
        assert_eq!(fs::read(&output).unwrap(), b"{\"num_networks\":0}");

        publisher.publish(b"{\"num_networks\":1,\"0xA\":{}}").unwrap();
        assert_eq!(fs::read(&output).unwrap(), b"{\"num_networks\":1,\"0xA\":{}}");
        assert_eq!(entries(dir.path()), vec!["network-info.json"]);
    }

    #[test]
    fn publishing_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.json");
        let publisher = AtomicFilePublisher::new(&output, "tmp.json");

        publisher.publish(b"same").unwrap();
        let once = fs::read(&output).unwrap();
        publisher.publish(b"same").unwrap();
        assert_eq!(fs::read(&output).unwrap(), once);
    }

    #[test]
    fn temporary_lives_next_to_output_with_configured_name() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.json");
        let publisher = AtomicFilePublisher::new(&output, "/elsewhere/tmp.json");

        let staged = publisher.stage(b"x").unwrap();
        let temp = staged.temp_path().to_path_buf();
        assert_eq!(temp.parent().unwrap(), dir.path());
        let name = temp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("tmp.") && name.ends_with(".json"), "{name}");

        let other = publisher.stage(b"y").unwrap();
        assert_ne!(other.temp_path(), temp.as_path());
    }

    #[test]
    fn fault_before_rename_leaves_previous_file_unchanged() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.json");
        let publisher = AtomicFilePublisher::new(&output, "tmp.json");
        publisher.publish(b"previous snapshot").unwrap();

        let staged = publisher.stage(b"new snapshot that never lands").unwrap();
        let temp = staged.temp_path().to_path_buf();
        assert_eq!(fs::read(&output).unwrap(), b"previous snapshot");
        drop(staged);

        assert!(!temp.exists());
        assert_eq!(fs::read(&output).unwrap(), b"previous snapshot");
        assert_eq!(entries(dir.path()), vec!["out.json"]);
    }

    #[test]
    fn commit_after_stage_lands_complete_content() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.json");
        let publisher = AtomicFilePublisher::new(&output, "tmp.json");
        publisher.publish(b"old").unwrap();

        let staged = publisher.stage(b"a considerably longer new snapshot").unwrap();
        staged.commit().unwrap();
        assert_eq!(fs::read(&output).unwrap(), b"a considerably longer new snapshot");
    }

    #[test]
    fn missing_directory_is_a_temp_write_failure() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("missing").join("out.json");
        let publisher = AtomicFilePublisher::new(&output, "tmp.json");

        let err = publisher.publish(b"data").unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::TempWriteFailed));
        assert!(!output.exists());
    }

    #[test]
    fn rename_onto_directory_fails_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.json");
        fs::create_dir(&output).unwrap();
        fs::write(output.join("keep"), b"occupied").unwrap();
        let publisher = AtomicFilePublisher::new(&output, "tmp.json");

        let err = publisher.publish(b"data").unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::RenameFailed));
        assert_eq!(entries(dir.path()), vec!["out.json"]);
        assert_eq!(fs::read(output.join("keep")).unwrap(), b"occupied");
    }

    #[test]
    fn construction_removes_leftover_temporaries_only() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("network-info.json");
        for name in ["tmp.abc123.json", "tmp.json.bak", "tmp.toolong7.json", "other.json"] {
            fs::write(dir.path().join(name), b"{").unwrap();
        }
        fs::write(&output, b"{\"num_networks\":0}").unwrap();

        let publisher = AtomicFilePublisher::new(&output, "tmp.json");

        assert_eq!(
            entries(dir.path()),
            vec!["network-info.json", "other.json", "tmp.json.bak", "tmp.toolong7.json"]
        );
        assert_eq!(fs::read(&output).unwrap(), b"{\"num_networks\":0}");
        assert_eq!(publisher.remove_stale_temporaries().unwrap(), 0);
    }

    #[test]
    fn staged_temporary_is_recognised_as_stale() {
        let dir = TempDir::new().unwrap();
        let publisher = AtomicFilePublisher::new(dir.path().join("out.json"), "tmp.json");

        let staged = publisher.stage(b"interrupted").unwrap();
        // Simulate a crash between staging and rename.
        let (_, path) = staged.file.keep().unwrap();
        assert!(path.exists());

        assert_eq!(publisher.remove_stale_temporaries().unwrap(), 1);
        assert!(!path.exists());
    }

    #[test]
    fn bare_file_name_publishes_into_current_directory_layout() {
        let publisher = AtomicFilePublisher::new("network-info.json", "tmp.json");
        assert_eq!(publisher.target(), Path::new("network-info.json"));
        assert_eq!(publisher.dir, PathBuf::from("."));
    }
}
