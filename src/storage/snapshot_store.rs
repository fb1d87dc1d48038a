use crate::storage::journal::sync_dir;
use crate::storage::records::{invalid_data, EncodedSnapshot, Snapshot};
use crate::storage::{framing, SnapshotStore};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".snap";
const TMP_SUFFIX: &str = ".tmp";

/// Stores each snapshot as `snapshot-<index>-<term>.snap`. A snapshot file only appears under its
/// final name once fully written and fsync'd, and the newest complete one wins on load.
pub(crate) struct FileSnapshotStore {
    logger: slog::Logger,
    directory: PathBuf,
}

impl FileSnapshotStore {
    pub(super) fn open(logger: slog::Logger, directory: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&directory)?;
        let store = FileSnapshotStore { logger, directory };
        store.remove_leftover_tmp_files()?;
        Ok(store)
    }

    fn file_name(index: u64, term: u64) -> String {
        format!("{}{}-{}{}", SNAPSHOT_PREFIX, index, term, SNAPSHOT_SUFFIX)
    }

    fn parse_file_name(name: &str) -> Option<(u64, u64)> {
        let stem = name.strip_prefix(SNAPSHOT_PREFIX)?.strip_suffix(SNAPSHOT_SUFFIX)?;
        let mut parts = stem.splitn(2, '-');
        let index = parts.next()?.parse().ok()?;
        let term = parts.next()?.parse().ok()?;
        Some((index, term))
    }

    /// Snapshot files on disk, newest first.
    fn list(&self) -> io::Result<Vec<(u64, u64, PathBuf)>> {
        let mut found = Vec::new();
        for dir_entry in fs::read_dir(&self.directory)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            if let Some((index, term)) = name.to_str().and_then(Self::parse_file_name) {
                found.push((index, term, dir_entry.path()));
            }
        }
        found.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        Ok(found)
    }

    fn remove_leftover_tmp_files(&self) -> io::Result<()> {
        for dir_entry in fs::read_dir(&self.directory)? {
            let path = dir_entry?.path();
            let is_tmp = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with(TMP_SUFFIX));
            if is_tmp {
                slog::info!(self.logger, "Removing incomplete snapshot {:?}", path);
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn read_snapshot_file(path: &Path) -> io::Result<Snapshot> {
        let data = fs::read(path)?;
        let frames = framing::read_frames(&data);
        if frames.payloads.len() != 1 || frames.valid_len != data.len() {
            return Err(invalid_data("Snapshot file is torn or corrupt"));
        }
        Snapshot::decode(frames.payloads[0])
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, snapshot: &EncodedSnapshot) -> io::Result<()> {
        let (term, index) = snapshot.last_included;
        let final_name = Self::file_name(index.as_u64(), term.as_u64());
        let final_path = self.directory.join(&final_name);
        let tmp_path = self.directory.join(format!("{}{}", final_name, TMP_SUFFIX));

        let mut buf = Vec::with_capacity(snapshot.data.len() + 8);
        framing::write_frame(&mut buf, &snapshot.data);
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;
        sync_dir(&self.directory)?;

        // Older snapshots are superseded. A newer one, installed while this was being written, stays.
        for (old_index, _, path) in self.list()? {
            if old_index < index.as_u64() {
                if let Err(e) = fs::remove_file(&path) {
                    slog::warn!(self.logger, "Failed to remove old snapshot {:?}: {:?}", path, e);
                }
            }
        }

        slog::info!(
            self.logger,
            "Persisted snapshot {:?} ({} bytes)",
            snapshot.last_included,
            snapshot.data.len()
        );
        Ok(())
    }

    fn load_latest(&self) -> io::Result<Option<Snapshot>> {
        for (index, term, path) in self.list()? {
            match Self::read_snapshot_file(&path) {
                Ok(snapshot) => {
                    slog::info!(self.logger, "Loaded snapshot Index={}, Term={}", index, term);
                    return Ok(Some(snapshot));
                }
                Err(e) => slog::warn!(self.logger, "Skipping unreadable snapshot {:?}: {:?}", path, e),
            }
        }
        Ok(None)
    }
}
