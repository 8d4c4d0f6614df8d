//! File-based sink implementations (ambient): concrete `SnapshotSink` /
//! `OperlogSink` / `OperlogSource` / `HistorySink` the demo binary wires up
//! so `main.rs` can exercise a full dump-then-restore cycle without an
//! external database -- a real deployment swaps these for `sqlx` impls
//! behind the same traits.
//!
//! The snapshot half is grounded on the teacher's `MatchingSnapshotter`
//! (atomic tmp-dir write, CRC64 checksum, `COMPLETE` marker, rename,
//! `latest` symlink), extended to also persist ledger balances and resting
//! orders across every market. The history half reuses the `to_csv()` /
//! `csv_header()` methods already on the event types, mirroring the
//! teacher's CSV dump functions.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc::{Crc, CRC_64_ECMA_182};

use crate::history::{HistoryRow, HistorySink, Stream};
use crate::messages::OperlogEntry;
use crate::operlog::OperlogSink;
use crate::snapshot::{BalanceRow, OperlogSource, OrderRow, SnapshotMarker, SnapshotSink};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

fn crc64_hex(bytes: &[u8]) -> String {
    format!("{:016x}", CRC64.checksum(bytes))
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct SnapshotBlob {
    marker: SnapshotMarker,
    balances: Vec<BalanceRow>,
    orders: Vec<OrderRow>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct SnapshotMetadata {
    checksum: String,
    marker: SnapshotMarker,
}

/// Accumulates a dump's rows in memory (batched calls from
/// [`crate::snapshot::persist`]) and commits them atomically on
/// `write_marker`, following the teacher's tmp-dir -> checksum ->
/// `COMPLETE` -> rename -> `latest` protocol.
pub struct FileSnapshotSink {
    dir: PathBuf,
    pending: Mutex<HashMap<i64, (Vec<BalanceRow>, Vec<OrderRow>)>>,
}

impl FileSnapshotSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf(), pending: Mutex::new(HashMap::new()) }
    }

    fn slice_dir(&self, ts: i64) -> PathBuf {
        self.dir.join(format!("slice-{ts}"))
    }

    fn latest_link(&self) -> PathBuf {
        self.dir.join("latest")
    }

    fn read_metadata(path: &Path) -> anyhow::Result<SnapshotMetadata> {
        let json = fs::read_to_string(path.join("metadata.json"))?;
        Ok(serde_json::from_str(&json)?)
    }

    fn read_blob(path: &Path, expected_checksum: &str) -> anyhow::Result<SnapshotBlob> {
        let bytes = fs::read(path.join("blob.bin"))?;
        if crc64_hex(&bytes) != expected_checksum {
            anyhow::bail!("snapshot checksum mismatch at {}", path.display());
        }
        Ok(bincode::deserialize(&bytes)?)
    }
}

#[async_trait::async_trait]
impl SnapshotSink for FileSnapshotSink {
    async fn write_balances(&self, ts: i64, rows: &[BalanceRow]) -> anyhow::Result<()> {
        self.pending.lock().unwrap().entry(ts).or_default().0.extend(rows.iter().cloned());
        Ok(())
    }

    async fn write_orders(&self, ts: i64, rows: &[OrderRow]) -> anyhow::Result<()> {
        self.pending.lock().unwrap().entry(ts).or_default().1.extend(rows.iter().cloned());
        Ok(())
    }

    async fn write_marker(&self, marker: &SnapshotMarker) -> anyhow::Result<()> {
        let (balances, orders) = self.pending.lock().unwrap().remove(&marker.ts).unwrap_or_default();
        fs::create_dir_all(&self.dir)?;

        let tmp_dir = self.dir.join(format!(".tmp-{}", marker.ts));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        let blob = SnapshotBlob { marker: *marker, balances, orders };
        let bytes = bincode::serialize(&blob)?;
        fs::write(tmp_dir.join("blob.bin"), &bytes)?;

        let metadata = SnapshotMetadata { checksum: crc64_hex(&bytes), marker: *marker };
        fs::write(tmp_dir.join("metadata.json"), serde_json::to_string_pretty(&metadata)?)?;
        fs::write(tmp_dir.join("COMPLETE"), "")?;

        let final_dir = self.slice_dir(marker.ts);
        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(&tmp_dir, &final_dir)?;

        let latest = self.latest_link();
        if latest.exists() || latest.symlink_metadata().is_ok() {
            fs::remove_file(&latest).or_else(|_| fs::remove_dir_all(&latest))?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(format!("slice-{}", marker.ts), &latest)?;
        #[cfg(windows)]
        std::os::windows::fs::symlink_dir(format!("slice-{}", marker.ts), &latest)?;

        Ok(())
    }

    async fn latest_marker(&self) -> anyhow::Result<Option<SnapshotMarker>> {
        let latest = self.latest_link();
        if !latest.exists() {
            return Ok(None);
        }
        Ok(Some(Self::read_metadata(&latest)?.marker))
    }

    async fn load_balances(&self, ts: i64) -> anyhow::Result<Vec<BalanceRow>> {
        let dir = self.slice_dir(ts);
        let metadata = Self::read_metadata(&dir)?;
        Ok(Self::read_blob(&dir, &metadata.checksum)?.balances)
    }

    async fn load_orders(&self, ts: i64) -> anyhow::Result<Vec<OrderRow>> {
        let dir = self.slice_dir(ts);
        let metadata = Self::read_metadata(&dir)?;
        Ok(Self::read_blob(&dir, &metadata.checksum)?.orders)
    }

    async fn list_markers(&self) -> anyhow::Result<Vec<SnapshotMarker>> {
        let mut out = Vec::new();
        if !self.dir.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("slice-") {
                continue;
            }
            if let Ok(metadata) = Self::read_metadata(&entry.path()) {
                out.push(metadata.marker);
            }
        }
        Ok(out)
    }

    async fn delete_slice(&self, ts: i64) -> anyhow::Result<()> {
        let dir = self.slice_dir(ts);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Appends JSON lines to one `operlog_<day>.jsonl` file per table name --
/// the real deployment's per-day Postgres table, here a per-day file.
pub struct FileOperlogSink {
    dir: PathBuf,
}

impl FileOperlogSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    fn path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.jsonl"))
    }
}

#[async_trait::async_trait]
impl OperlogSink for FileOperlogSink {
    async fn write_batch(&self, table: &str, entries: &[OperlogEntry]) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(self.path(table))?;
        for entry in entries {
            writeln!(file, "{}", serde_json::to_string(entry)?)?;
        }
        Ok(())
    }
}

pub struct FileOperlogSource {
    dir: PathBuf,
}

impl FileOperlogSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }
}

#[async_trait::async_trait]
impl OperlogSource for FileOperlogSource {
    async fn read_since(&self, table: &str, after_id: u64) -> anyhow::Result<Vec<OperlogEntry>> {
        let path = self.dir.join(format!("{table}.jsonl"));
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path)?;
        let mut out = Vec::new();
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            let entry: OperlogEntry = serde_json::from_str(line)?;
            if entry.id > after_id {
                out.push(entry);
            }
        }
        out.sort_by_key(|e| e.id);
        Ok(out)
    }
}

/// Appends CSV rows to one file per `(stream, partition)`, writing the
/// header line only the first time a file is created.
pub struct FileHistorySink {
    dir: PathBuf,
}

impl FileHistorySink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    fn append(&self, name: &str, header: &str, lines: impl Iterator<Item = String>) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        let write_header = !path.exists();
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        if write_header {
            writeln!(file, "{header}")?;
        }
        for line in lines {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl HistorySink for FileHistorySink {
    async fn write_rows(&self, stream: Stream, partition: u64, rows: &[HistoryRow]) -> anyhow::Result<()> {
        let name = format!("history_{stream:?}_{partition}.csv");
        let lines: Vec<String> = rows
            .iter()
            .map(|row| match row {
                HistoryRow::Order(ev) => ev.to_csv(),
                HistoryRow::Deal(ev) => ev.to_csv(),
                HistoryRow::Balance(ev) => ev.to_csv(),
            })
            .collect();
        let header = match rows.first() {
            Some(HistoryRow::Order(_)) => crate::messages::OrderEvent::csv_header(),
            Some(HistoryRow::Deal(_)) => crate::messages::DealEvent::csv_header(),
            Some(HistoryRow::Balance(_)) => crate::messages::BalanceHistoryEvent::csv_header(),
            None => return Ok(()),
        };
        self.append(&name, header, lines.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::BalanceKind;

    fn tmp_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("matching_core_persistence_test_{label}_{}", std::process::id()))
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tmp_dir("snapshot");
        let _ = fs::remove_dir_all(&dir);
        let sink = FileSnapshotSink::new(&dir);

        let marker = SnapshotMarker { ts: 42, order_id_seq: 3, deal_id_seq: 1, operlog_id_seq: 5, operlog_day: 19000 };
        sink.write_balances(42, &[BalanceRow { user_id: 1, kind: BalanceKind::Available, asset: "STK".into(), value: "10".parse().unwrap() }])
            .await
            .unwrap();
        sink.write_marker(&marker).await.unwrap();

        let loaded = sink.latest_marker().await.unwrap().unwrap();
        assert_eq!(loaded.ts, 42);
        let balances = sink.load_balances(42).await.unwrap();
        assert_eq!(balances.len(), 1);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn corrupted_blob_fails_checksum() {
        let dir = tmp_dir("corrupt");
        let _ = fs::remove_dir_all(&dir);
        let sink = FileSnapshotSink::new(&dir);
        let marker = SnapshotMarker { ts: 1, order_id_seq: 0, deal_id_seq: 0, operlog_id_seq: 0, operlog_day: 0 };
        sink.write_marker(&marker).await.unwrap();

        fs::write(dir.join("slice-1").join("blob.bin"), b"corrupted").unwrap();
        assert!(sink.load_balances(1).await.is_err());

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn operlog_file_round_trips() {
        let dir = tmp_dir("operlog");
        let _ = fs::remove_dir_all(&dir);
        let sink = FileOperlogSink::new(&dir);
        let source = FileOperlogSource::new(&dir);

        sink.write_batch("operlog_19000", &[OperlogEntry { id: 1, time: 0.0, detail: serde_json::json!({"a": 1}) }])
            .await
            .unwrap();
        sink.write_batch("operlog_19000", &[OperlogEntry { id: 2, time: 1.0, detail: serde_json::json!({"a": 2}) }])
            .await
            .unwrap();

        let rows = source.read_since("operlog_19000", 1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 2);

        let _ = fs::remove_dir_all(&dir);
    }
}
