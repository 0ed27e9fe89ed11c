//! JSON Lines close-command journal.
//!
//! Each accepted [`CloseCommand`] becomes one line in
//! `close_commands_<YYYY-MM-DD>.jsonl` under the journal directory. Files are
//! opened in append mode and flushed before a command is confirmed, so a
//! crash loses at most the line being written.

use crate::error::{PersistenceError, PersistenceResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tickguard_position::{CloseCommand, CommandSink, PositionResult};
use tracing::{debug, info, warn};

/// Writer for the current day's file.
struct ActiveWriter {
    writer: BufWriter<File>,
    date: String,
    records_written: usize,
}

/// Append-only command sink backed by daily JSON Lines files.
pub struct CommandJournal {
    base_dir: PathBuf,
    active: Mutex<Option<ActiveWriter>>,
}

impl CommandJournal {
    /// Open a journal rooted at `base_dir`, creating the directory.
    pub fn open(base_dir: impl AsRef<Path>) -> PersistenceResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        info!(dir = %base_dir.display(), "Command journal opened");
        Ok(Self {
            base_dir,
            active: Mutex::new(None),
        })
    }

    /// Path of the journal file for `date` (`YYYY-MM-DD`).
    pub fn file_for(&self, date: &str) -> PathBuf {
        self.base_dir.join(format!("close_commands_{date}.jsonl"))
    }

    /// Append one command and flush it to disk.
    pub fn append(&self, command: &CloseCommand) -> PersistenceResult<()> {
        let date = command.issued_at.format("%Y-%m-%d").to_string();
        let line = serde_json::to_string(command)?;

        let mut active = self.active.lock();
        let current = match active.take() {
            Some(writer) if writer.date == date => writer,
            previous => {
                if let Some(previous) = previous {
                    close_writer(previous);
                }
                self.create_writer(&date)?
            }
        };
        let writer = active.insert(current);

        if let Err(e) = write_line(&mut writer.writer, &line) {
            // An unconfirmed line must not reach disk behind a later command.
            if let Some(failed) = active.take() {
                discard_writer(failed);
            }
            warn!(
                command_id = %command.command_id,
                error = %e,
                "Journal write failed, writer discarded"
            );
            return Err(e.into());
        }
        writer.records_written += 1;

        debug!(
            command_id = %command.command_id,
            position_id = %command.position_id,
            date = %date,
            "Close command journaled"
        );
        Ok(())
    }

    /// Flush and release the current file.
    pub fn close(&self) {
        if let Some(writer) = self.active.lock().take() {
            close_writer(writer);
        }
    }

    fn create_writer(&self, date: &str) -> PersistenceResult<ActiveWriter> {
        let path = self.file_for(date);
        info!(path = %path.display(), "Opening command journal file (append mode)");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(ActiveWriter {
            writer: BufWriter::new(file),
            date: date.to_string(),
            records_written: 0,
        })
    }
}

fn write_line(writer: &mut BufWriter<File>, line: &str) -> std::io::Result<()> {
    writeln!(writer, "{line}")?;
    writer.flush()
}

/// Drop a writer without flushing what is still buffered.
fn discard_writer(active: ActiveWriter) {
    let (_file, unflushed) = active.writer.into_parts();
    debug!(
        date = %active.date,
        dropped_bytes = unflushed.map(|b| b.len()).unwrap_or(0),
        "Discarded journal writer"
    );
}

fn close_writer(mut active: ActiveWriter) {
    if let Err(e) = active.writer.flush() {
        warn!(?e, "Failed to flush journal on close");
    }
    info!(
        date = %active.date,
        records = active.records_written,
        "Closed command journal file"
    );
}

impl CommandSink for CommandJournal {
    fn submit_close(&self, command: &CloseCommand) -> PositionResult<()> {
        self.append(command).map_err(PersistenceError::into_sink)
    }
}

impl Drop for CommandJournal {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read every command from a journal file. Corrupt lines are skipped.
pub fn read_journal(path: impl AsRef<Path>) -> PersistenceResult<Vec<CloseCommand>> {
    let file = File::open(path.as_ref())?;
    let mut commands = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(command) => commands.push(command),
            Err(e) => warn!(line = index + 1, error = %e, "Skipping corrupt journal line"),
        }
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;
    use tickguard_core::{Price, Side};
    use tickguard_position::CloseReason;
    use uuid::Uuid;

    fn command(position_id: &str, day: u32, fraction: Option<rust_decimal::Decimal>) -> CloseCommand {
        CloseCommand {
            command_id: Uuid::new_v4(),
            position_id: position_id.to_string(),
            symbol: "ETH/USDT".to_string(),
            side: Side::Short,
            reason: CloseReason::TakeProfit,
            fraction,
            trigger_price: Some(Price::new(dec!(2910))),
            issued_at: Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let journal = CommandJournal::open(dir.path()).unwrap();

        let first = command("eth-1", 1, Some(dec!(0.33)));
        let second = command("eth-1", 1, None);
        journal.submit_close(&first).unwrap();
        journal.submit_close(&second).unwrap();

        // Flushed before confirming: readable without closing.
        let read = read_journal(journal.file_for("2024-03-01")).unwrap();
        assert_eq!(read, vec![first, second]);
    }

    #[test]
    fn test_daily_rotation() {
        let dir = TempDir::new().unwrap();
        let journal = CommandJournal::open(dir.path()).unwrap();
        journal.append(&command("a", 1, None)).unwrap();
        journal.append(&command("b", 2, None)).unwrap();
        journal.close();

        assert_eq!(read_journal(journal.file_for("2024-03-01")).unwrap().len(), 1);
        let day_two = read_journal(journal.file_for("2024-03-02")).unwrap();
        assert_eq!(day_two[0].position_id, "b");
    }

    #[test]
    fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        {
            let journal = CommandJournal::open(dir.path()).unwrap();
            journal.append(&command("a", 1, None)).unwrap();
        }
        let journal = CommandJournal::open(dir.path()).unwrap();
        journal.append(&command("b", 1, None)).unwrap();

        let read = read_journal(journal.file_for("2024-03-01")).unwrap();
        assert_eq!(read.len(), 2);
    }

    #[test]
    fn test_corrupt_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let journal = CommandJournal::open(dir.path()).unwrap();
        journal.append(&command("a", 1, None)).unwrap();
        journal.close();

        let path = journal.file_for("2024-03-01");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{\"truncated\":").unwrap();

        assert_eq!(read_journal(&path).unwrap().len(), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_flush_never_resurfaces() {
        let dir = TempDir::new().unwrap();
        let journal = CommandJournal::open(dir.path()).unwrap();

        // Every write to /dev/full fails with ENOSPC on flush.
        let full = OpenOptions::new().write(true).open("/dev/full").unwrap();
        *journal.active.lock() = Some(ActiveWriter {
            writer: BufWriter::new(full),
            date: "2024-03-01".to_string(),
            records_written: 0,
        });

        let rejected = command("eth-1", 1, None);
        let err = journal.submit_close(&rejected).unwrap_err();
        assert!(matches!(err, tickguard_position::PositionError::Sink(_)));
        assert!(journal.active.lock().is_none());

        // The retry lands in a fresh file; the rejected line is gone.
        let retry = command("eth-1", 1, None);
        journal.submit_close(&retry).unwrap();
        journal.close();

        let read = read_journal(journal.file_for("2024-03-01")).unwrap();
        assert_eq!(read, vec![retry]);
    }

    #[test]
    fn test_unwritable_dir_maps_to_sink_error() {
        let dir = TempDir::new().unwrap();
        let journal = CommandJournal::open(dir.path().join("journal")).unwrap();
        std::fs::remove_dir_all(dir.path().join("journal")).unwrap();

        let err = journal.submit_close(&command("a", 1, None)).unwrap_err();
        assert!(matches!(err, tickguard_position::PositionError::Sink(_)));
    }
}
