// ===============================
// src/recorder.rs
// ===============================
//
// Decision log (append-only):
// - DecisionSink: satu-satunya pintu keluar DecisionRecord dari agent.
// - JsonlRecorder: satu record per baris di file .jsonl, BufWriter,
//   flush tiap 1s dan/atau tiap 1000 record, reopen kalau tulis gagal.
// - MemorySink: untuk test & mode tanpa file.
//
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::DecisionRecord;

#[async_trait]
pub trait DecisionSink: Send + Sync {
    async fn save(&self, record: DecisionRecord);

    /// Most recent `n` records of one trader, oldest first.
    async fn recent(&self, _trader_id: &str, _n: usize) -> Vec<DecisionRecord> {
        Vec::new()
    }

    async fn flush(&self) {}
}

enum Cmd {
    Record(Box<DecisionRecord>),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct JsonlRecorder {
    tx: mpsc::Sender<Cmd>,
    path: PathBuf,
}

impl JsonlRecorder {
    /// Starts the writer task. The task ends once every clone is dropped.
    pub fn spawn(path: impl Into<PathBuf>) -> (Self, JoinHandle<()>) {
        let path = path.into();
        let (tx, rx) = mpsc::channel(8192);
        let handle = tokio::spawn(run(rx, path.clone()));
        (Self { tx, path }, handle)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DecisionSink for JsonlRecorder {
    async fn save(&self, record: DecisionRecord) {
        // Bounded channel: agent menunggu kalau writer tertinggal, record tidak dibuang
        if self.tx.send(Cmd::Record(Box::new(record))).await.is_err() {
            error!(path = %self.path.display(), "recorder: writer task gone, record lost");
        }
    }

    async fn recent(&self, trader_id: &str, n: usize) -> Vec<DecisionRecord> {
        self.flush().await;
        match read_recent(&self.path, trader_id, n).await {
            Ok(v) => v,
            Err(e) => {
                warn!(?e, path = %self.path.display(), "recorder: history read failed");
                Vec::new()
            }
        }
    }

    async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Cmd::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Reads the tail of a JSONL decision log for one trader. Unparseable lines
/// (e.g. a torn last write) are skipped.
pub async fn read_recent(path: &Path, trader_id: &str, n: usize) -> std::io::Result<Vec<DecisionRecord>> {
    let text = match fs::read_to_string(path).await {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut out: Vec<DecisionRecord> = text
        .lines()
        .filter_map(|l| serde_json::from_str::<DecisionRecord>(l).ok())
        .filter(|r| r.trader_id == trader_id)
        .collect();
    if out.len() > n {
        out.drain(..out.len() - n);
    }
    Ok(out)
}

async fn open_writer(path: &Path) -> std::io::Result<BufWriter<tokio::fs::File>> {
    // Pastikan parent directory ada (kalau ada)
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut Option<BufWriter<tokio::fs::File>>, path: &Path, line: &[u8]) -> bool {
    for attempt in 0..2 {
        if writer.is_none() {
            match open_writer(path).await {
                Ok(w) => *writer = Some(w),
                Err(e) => {
                    error!(?e, path = %path.display(), "recorder: open failed");
                    return false;
                }
            }
        }
        if let Some(w) = writer.as_mut() {
            match w.write_all(line).await {
                Ok(()) => return true,
                Err(e) => {
                    // buang writer lama, coba reopen sekali
                    error!(?e, attempt, "recorder: write failed, reopening");
                    *writer = None;
                }
            }
        }
    }
    false
}

/// Flushes the buffer; on failure the writer is dropped so the next record
/// reopens the file.
async fn flush_writer(writer: &mut Option<BufWriter<tokio::fs::File>>, pending: u32) {
    let Some(w) = writer.as_mut() else { return };
    if let Err(e) = w.flush().await {
        error!(?e, pending, "recorder: flush failed, buffered records may be lost, reopening");
        *writer = None;
    }
}

async fn run(mut rx: mpsc::Receiver<Cmd>, path: PathBuf) {
    info!(path = %path.display(), "recorder: started");
    let mut writer = match open_writer(&path).await {
        Ok(w) => Some(w),
        Err(e) => {
            error!(?e, path = %path.display(), "recorder: open failed, will retry on next record");
            None
        }
    };

    // Flush periodik (tiap 1 detik) + flush berbasis jumlah record
    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut since_last_flush: u32 = 0;
    const FLUSH_EVERY_N_RECORDS: u32 = 1000;

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(Cmd::Record(rec)) => {
                        let mut line = match serde_json::to_vec(&*rec) {
                            Ok(s) => s,
                            Err(e) => {
                                error!(?e, trader = %rec.trader_id, cycle = rec.cycle, "recorder: serialize error, skip record");
                                continue;
                            }
                        };
                        line.push(b'\n');
                        if !write_line(&mut writer, &path, &line).await {
                            error!(trader = %rec.trader_id, cycle = rec.cycle, "recorder: record dropped after reopen");
                            continue;
                        }
                        since_last_flush += 1;
                        if since_last_flush >= FLUSH_EVERY_N_RECORDS {
                            flush_writer(&mut writer, since_last_flush).await;
                            since_last_flush = 0;
                        }
                    }
                    Some(Cmd::Flush(ack)) => {
                        flush_writer(&mut writer, since_last_flush).await;
                        since_last_flush = 0;
                        let _ = ack.send(());
                    }
                    None => {
                        // Channel closed: flush dan keluar
                        flush_writer(&mut writer, since_last_flush).await;
                        info!("recorder: channel closed, stopped");
                        break;
                    }
                }
            }

            _ = tick.tick() => {
                if since_last_flush > 0 {
                    flush_writer(&mut writer, since_last_flush).await;
                    since_last_flush = 0;
                }
            }
        }
    }
}

/// Keeps every record in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<DecisionRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DecisionRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn for_trader(&self, trader_id: &str) -> Vec<DecisionRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.trader_id == trader_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DecisionSink for MemorySink {
    async fn save(&self, record: DecisionRecord) {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).push(record);
    }

    async fn recent(&self, trader_id: &str, n: usize) -> Vec<DecisionRecord> {
        let mut v = self.for_trader(trader_id);
        if v.len() > n {
            v.drain(..v.len() - n);
        }
        v
    }
}
