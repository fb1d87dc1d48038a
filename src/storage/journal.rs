use crate::storage::framing;
use crate::storage::records::JournalEntry;
use crate::storage::replay::JournalReplay;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Journal is the append-only file behind `FileStore`. Writes are fsync'd before returning.
pub(super) struct Journal {
    logger: slog::Logger,
    path: PathBuf,
    file: File,
}

impl Journal {
    pub(super) fn open(logger: slog::Logger, path: PathBuf) -> io::Result<Self> {
        let file = Self::open_for_append(&path)?;
        Ok(Journal { logger, path, file })
    }

    fn open_for_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).read(true).append(true).open(path)
    }

    /// Reads every record from the start. A torn or corrupt tail (a crash mid-append) is
    /// truncated away so later appends land after the last good record.
    pub(super) fn replay(&mut self) -> io::Result<JournalReplay> {
        let data = fs::read(&self.path)?;
        let frames = framing::read_frames(&data);

        if frames.valid_len < data.len() {
            slog::warn!(
                self.logger,
                "Truncating journal tail. ValidBytes={}, FileBytes={}",
                frames.valid_len,
                data.len()
            );
            self.file.set_len(frames.valid_len as u64)?;
            self.file.sync_all()?;
        }

        let mut replay = JournalReplay::new();
        let mut num_records = 0;
        for payload in frames.payloads {
            match JournalEntry::decode(payload)? {
                Some(record) => replay.apply(record)?,
                None => slog::warn!(self.logger, "Skipping journal record of unknown kind"),
            }
            num_records += 1;
        }
        slog::info!(self.logger, "Replayed {} journal records from {:?}", num_records, self.path);

        Ok(replay)
    }

    pub(super) fn append(&mut self, records: &[JournalEntry]) -> io::Result<()> {
        let buf = Self::encode_all(records)?;
        self.file.write_all(&buf)?;
        self.file.sync_data()
    }

    /// Atomically replaces the journal with `records`.
    pub(super) fn rewrite(&mut self, records: &[JournalEntry]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("rewrite");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&Self::encode_all(records)?)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        if let Some(dir) = self.path.parent() {
            sync_dir(dir)?;
        }

        self.file = Self::open_for_append(&self.path)?;
        slog::info!(self.logger, "Rewrote journal with {} live records", records.len());
        Ok(())
    }

    fn encode_all(records: &[JournalEntry]) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        for record in records {
            framing::write_frame(&mut buf, &record.encode()?);
        }
        Ok(buf)
    }
}

/// Makes a rename inside `dir` durable.
pub(super) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}
