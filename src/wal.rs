use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Append-only write-ahead log.
///
/// Entry layout: `[u32: len][bincode: Event][u32: crc32]`, all little-endian.
/// `len` covers the bincode payload only. A crash mid-append leaves a
/// truncated or CRC-failing tail, which replay silently discards.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

fn encode_entry(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Buffer one event without flushing. The group-commit writer calls this
    /// for a whole batch and then `sync()` once.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_entry(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush buffered entries and fsync the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Append a single event durably. Test convenience; production goes
    /// through `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Phase one of compaction: write the replacement events to a sibling
    /// temp file and fsync it. Slow I/O — runs outside any engine lock.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for event in events {
            encode_entry(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Phase two: atomically rename the temp file over the live WAL and
    /// reopen for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Both compaction phases back to back. Test convenience.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact event from disk. A missing file is an empty log;
    /// a truncated or corrupt tail ends the replay without error.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    use crate::model::{CapacityAction, ExceptionKind};

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reserva_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, 1).unwrap()
    }

    fn sample_events() -> Vec<Event> {
        vec![
            Event::ExceptionUpserted {
                service_id: Ulid::new(),
                date: date(),
                kind: ExceptionKind::Blocked,
            },
            Event::CapacityAdjusted {
                service_id: Ulid::new(),
                location_id: None,
                start: date(),
                end: date(),
                action: CapacityAction::SetCapacity,
                capacity: Some(5),
            },
            Event::BookingCancelled { id: Ulid::new() },
        ]
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = sample_events();

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file_is_empty() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_discards_truncated_tail() {
        let path = tmp_path("truncated.wal");
        let events = sample_events();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&events[0]).unwrap();
        }
        {
            // Partial length prefix plus garbage — a crashed append.
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8; 6]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0], events[0]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let event = Event::BookingConfirmed { id: Ulid::new() };

        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_shrinks_and_preserves_replacement() {
        let path = tmp_path("compact.wal");
        let keep = Event::BookingCompleted { id: Ulid::new() };

        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..20 {
                for e in &sample_events() {
                    wal.append(e).unwrap();
                }
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(std::slice::from_ref(&keep)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
        }
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        assert_eq!(Wal::replay(&path).unwrap(), vec![keep]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_after_compact_survives_replay() {
        let path = tmp_path("compact_then_append.wal");
        let base = Event::BookingCancelled { id: Ulid::new() };
        let tail = Event::BookingConfirmed { id: Ulid::new() };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&base).unwrap();
            wal.compact(std::slice::from_ref(&base)).unwrap();
            wal.append(&tail).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![base, tail]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_commit_on_sync() {
        let path = tmp_path("buffered.wal");
        let events = sample_events();

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), events.len() as u64);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);

        let _ = fs::remove_file(&path);
    }
}
