use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::model::Event;

/// Upper bound on one record's payload. A length prefix above it is treated as corruption.
pub const MAX_RECORD_LEN: usize = 1 << 20;

/// Record layout: `[u32 le: payload len][bincode Event][u32 le: crc32 of payload]`.
fn write_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "record too large"));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

enum ReadOutcome {
    /// An intact record and its size on disk.
    Record(Event, u64),
    /// Clean end of file.
    End,
    /// Short read, bad checksum or undecodable payload. Everything from here on is dropped.
    Torn,
}

/// `read_exact` that reports a short read as `Ok(false)`.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_record(reader: &mut impl Read) -> io::Result<ReadOutcome> {
    let mut len_buf = [0u8; 4];
    let mut first = [0u8; 1];
    // Distinguish a clean EOF from a torn length prefix.
    if reader.read(&mut first)? == 0 {
        return Ok(ReadOutcome::End);
    }
    len_buf[0] = first[0];
    if !fill(reader, &mut len_buf[1..])? {
        return Ok(ReadOutcome::Torn);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(ReadOutcome::Torn);
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !fill(reader, &mut payload)? || !fill(reader, &mut crc_buf)? {
        return Ok(ReadOutcome::Torn);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(ReadOutcome::Torn);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(ReadOutcome::Record(event, 8 + len as u64)),
        Err(_) => Ok(ReadOutcome::Torn),
    }
}

/// Append-only write-ahead log of [`Event`]s.
///
/// A crash mid-write leaves at most one torn record at the tail. Replay cuts it off
/// so later appends follow the last intact record.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length after the last successful fsync.
    durable_len: u64,
    /// Set while unsynced bytes may still sit past `durable_len`.
    dirty: bool,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            durable_len,
            dirty: false,
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one record. Not durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.dirty {
            self.discard_unsynced()?;
        }
        write_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len = self.writer.get_ref().metadata()?.len();
        Ok(())
    }

    /// Drop everything written since the last successful fsync, buffered or not.
    pub fn discard_unsynced(&mut self) -> io::Result<()> {
        self.dirty = true;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        // `into_parts` hands back the buffer instead of flushing it on drop.
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let _ = stale.into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.durable_len)?;
        file.sync_all()?;
        self.dirty = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `events`: write a sibling temp file, fsync, rename over.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                write_record(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let _ = stale.into_parts();
        self.dirty = false;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every intact record. A missing file is an empty log.
    ///
    /// A torn or corrupt tail is truncated away before returning, otherwise records
    /// appended after it would be unreachable on the next replay.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut intact_len = 0u64;
        loop {
            match read_record(&mut reader)? {
                ReadOutcome::Record(event, size) => {
                    events.push(event);
                    intact_len += size;
                }
                ReadOutcome::End => break,
                ReadOutcome::Torn => {
                    warn!(
                        path = %path.display(),
                        kept = events.len(),
                        offset = intact_len,
                        "WAL has a torn or corrupt tail; truncating it"
                    );
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(intact_len)?;
                    file.sync_all()?;
                    break;
                }
            }
        }
        Ok(events)
    }
}

// ── Group-commit writer task ─────────────────────────────

pub enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Rewrite {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Spawn the task that owns `wal`. Appends that arrive together share one fsync.
pub fn spawn_writer(wal: Wal, capacity: usize) -> mpsc::Sender<WalCommand> {
    let (tx, rx) = mpsc::channel(capacity);
    tokio::spawn(writer_loop(wal, rx));
    tx
}

async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };
        let mut batch: Vec<Pending> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    let result = result.and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        // Partial bytes of a failed batch must not sit in front of the next one.
        warn!("WAL batch failed, rolling back to last synced record: {e}");
        if let Err(e) = wal.discard_unsynced() {
            tracing::error!("WAL rollback failed: {e}");
        }
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Rewrite { events, response } => {
            let _ = response.send(wal.rewrite(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{span, Guest, Reservation, Restriction, RestrictionKind, Room};

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("innkeep_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn room_created(id: i64) -> Event {
        Event::RoomCreated {
            room: Room {
                id,
                name: format!("Room {id}"),
                created_at: 0,
                updated_at: 0,
            },
        }
    }

    fn block_added(id: i64, room_id: i64) -> Event {
        Event::BlockAdded {
            restriction: Restriction {
                id,
                room_id,
                span: span("2024-03-05", "2024-03-06"),
                kind: RestrictionKind::Block,
                created_at: 0,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            room_created(1),
            Event::ReservationBooked {
                reservation: Reservation {
                    id: 1,
                    room_id: 1,
                    span: span("2024-03-10", "2024-03-15"),
                    guest: Guest {
                        first_name: "John".into(),
                        last_name: "Smith".into(),
                        email: "john@here.com".into(),
                        phone: String::new(),
                    },
                    processed: false,
                    created_at: 0,
                    updated_at: 0,
                },
                restriction_id: 1,
            },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room_created(1)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }
        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![room_created(1)]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_truncates_torn_tail_so_appends_stay_reachable() {
        let path = tmp_path("torn_then_append.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room_created(1)).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0x40, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![room_created(1)]);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room_created(2)).unwrap();
        }
        assert_eq!(
            Wal::replay(&path).unwrap(),
            vec![room_created(1), room_created(2)]
        );
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn oversized_length_prefix_is_torn() {
        let path = tmp_path("oversized_prefix.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room_created(1)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![room_created(1)]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn discard_unsynced_rolls_back_partial_batch() {
        let path = tmp_path("discard_unsynced.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&room_created(1)).unwrap();

        // Bytes of a batch that never got its fsync reach the file.
        wal.append_buffered(&room_created(2)).unwrap();
        wal.writer.flush().unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8; 3]).unwrap();
        }
        wal.discard_unsynced().unwrap();

        wal.append(&room_created(3)).unwrap();
        drop(wal);
        assert_eq!(
            Wal::replay(&path).unwrap(),
            vec![room_created(1), room_created(3)]
        );
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_drops_short_length_prefix() {
        let path = tmp_path("short_prefix.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room_created(1)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[1u8, 0]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().len(), 1);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        {
            let payload = bincode::serialize(&room_created(3)).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rewrite_shrinks_and_accepts_appends() {
        let path = tmp_path("rewrite.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&room_created(1)).unwrap();
        for id in 1..=20 {
            wal.append(&block_added(id, 1)).unwrap();
            wal.append(&Event::BlockRemoved { id, room_id: 1 }).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();
        assert_eq!(wal.appends_since_compact(), 41);

        wal.rewrite(&[room_created(1)]).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "rewritten WAL should be smaller: {after} < {before}");

        wal.append(&block_added(99, 1)).unwrap();
        drop(wal);
        assert_eq!(
            Wal::replay(&path).unwrap(),
            vec![room_created(1), block_added(99, 1)]
        );
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn writer_task_commits_concurrent_appends() {
        let path = tmp_path("writer_task.wal");
        let tx = spawn_writer(Wal::open(&path).unwrap(), 64);

        let mut waiters = Vec::new();
        for id in 1..=10 {
            let (resp_tx, resp_rx) = oneshot::channel();
            tx.send(WalCommand::Append {
                event: room_created(id),
                response: resp_tx,
            })
            .await
            .unwrap();
            waiters.push(resp_rx);
        }
        for rx in waiters {
            rx.await.unwrap().unwrap();
        }

        let (count_tx, count_rx) = oneshot::channel();
        tx.send(WalCommand::AppendsSinceCompact { response: count_tx })
            .await
            .unwrap();
        assert_eq!(count_rx.await.unwrap(), 10);
        assert_eq!(Wal::replay(&path).unwrap().len(), 10);
        let _ = fs::remove_file(&path);
    }
}
