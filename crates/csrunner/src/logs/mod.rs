use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use regex::RegexBuilder;
use serde::Serialize;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader as AsyncBufReader};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

pub const CURRENT_RUN: &str = "current";

/// Lines a chatty child can outrun the disk by before we start dropping.
const DEFAULT_BUFFER_LINES: usize = 4096;

const LINE_TS: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");
const RUN_ID_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]-[hour]-[minute]-[second]");

pub fn run_id_for(instant: OffsetDateTime) -> String {
    instant
        .format(RUN_ID_FORMAT)
        .unwrap_or_else(|_| "unknown-run".to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    #[serde(with = "time::serde::rfc3339::option")]
    pub ts: Option<OffsetDateTime>,
    pub stream: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub run_id: String,
    pub line_number: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    pub text: String,
    pub context_before: Vec<String>,
    pub context_after: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRunInfo {
    pub run_id: String,
    pub file_size: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub modified_at: Option<OffsetDateTime>,
}

/// Owns the per-app writer pipelines and answers tail/search/list queries
/// with plain directory reads, so queries never depend on a live writer.
pub struct LogManager {
    root: PathBuf,
    retention: usize,
    max_size_bytes: u64,
    writers: Mutex<HashMap<(String, String), Arc<LogWriter>>>,
}

impl LogManager {
    pub fn new(root: PathBuf, retention: usize, max_size_mb: u64) -> Self {
        Self {
            root,
            retention: retention.max(1),
            max_size_bytes: max_size_mb.max(1) * 1024 * 1024,
            writers: Mutex::new(HashMap::new()),
        }
    }

    fn app_dir(&self, config_id: &str, app_id: &str) -> PathBuf {
        self.root.join(config_id).join(app_id)
    }

    fn log_path(&self, config_id: &str, app_id: &str, run_id: &str) -> PathBuf {
        self.app_dir(config_id, app_id).join(format!("{run_id}.log"))
    }

    /// The per-app pipeline singleton, created on first use.
    pub fn writer(&self, config_id: &str, app_id: &str) -> Arc<LogWriter> {
        let key = (config_id.to_string(), app_id.to_string());
        let mut writers = self.writers.lock();
        writers
            .entry(key)
            .or_insert_with(|| {
                LogWriter::spawn(
                    self.app_dir(config_id, app_id),
                    self.retention,
                    self.max_size_bytes,
                    DEFAULT_BUFFER_LINES,
                )
            })
            .clone()
    }

    /// Up to `lines` trailing entries from the given run (default current).
    /// Tolerates concurrent appends; a torn final line parses as text-only.
    pub fn tail(
        &self,
        config_id: &str,
        app_id: &str,
        lines: usize,
        run_id: Option<&str>,
    ) -> Vec<LogEntry> {
        let path = self.log_path(config_id, app_id, run_id.unwrap_or(CURRENT_RUN));
        let Ok(file) = File::open(&path) else {
            return Vec::new();
        };
        let mut entries: VecDeque<LogEntry> = VecDeque::with_capacity(lines.min(1024));
        for line in BufReader::new(file).lines().map_while(Result::ok) {
            if entries.len() == lines {
                entries.pop_front();
            }
            entries.push_back(parse_line(&line));
        }
        entries.into()
    }

    /// Regex search over current plus archives, newest file first, matches
    /// in file order, with one line of context on each side. An invalid
    /// pattern falls back to a literal match.
    pub fn search(
        &self,
        config_id: &str,
        app_id: &str,
        query: &str,
        max_results: usize,
        case_sensitive: bool,
    ) -> Vec<SearchMatch> {
        let pattern = RegexBuilder::new(query)
            .case_insensitive(!case_sensitive)
            .build()
            .unwrap_or_else(|_| {
                debug!(query, "pattern did not compile, searching literally");
                RegexBuilder::new(&regex::escape(query))
                    .case_insensitive(!case_sensitive)
                    .build()
                    .expect("escaped pattern compiles")
            });

        let mut results = Vec::new();
        let mut files = vec![(
            CURRENT_RUN.to_string(),
            self.log_path(config_id, app_id, CURRENT_RUN),
        )];
        for run in self.list_runs(config_id, app_id) {
            let path = self.log_path(config_id, app_id, &run.run_id);
            files.push((run.run_id, path));
        }

        'files: for (run_id, path) in files {
            let Ok(file) = File::open(&path) else {
                continue;
            };
            let lines: Vec<String> = BufReader::new(file).lines().map_while(Result::ok).collect();
            for (i, line) in lines.iter().enumerate() {
                if !pattern.is_match(line) {
                    continue;
                }
                let entry = parse_line(line);
                results.push(SearchMatch {
                    run_id: run_id.clone(),
                    line_number: i + 1,
                    timestamp: entry.ts,
                    text: line.clone(),
                    context_before: lines[i.saturating_sub(1)..i].to_vec(),
                    context_after: lines[i + 1..(i + 2).min(lines.len())].to_vec(),
                });
                if results.len() >= max_results {
                    break 'files;
                }
            }
        }
        results
    }

    /// Archive metadata, newest first. Run-id names sort chronologically.
    pub fn list_runs(&self, config_id: &str, app_id: &str) -> Vec<LogRunInfo> {
        list_archives(&self.app_dir(config_id, app_id))
            .into_iter()
            .map(|(run_id, path)| {
                let meta = std::fs::metadata(&path).ok();
                LogRunInfo {
                    run_id,
                    file_size: meta.as_ref().map(|m| m.len()).unwrap_or(0),
                    modified_at: meta
                        .and_then(|m| m.modified().ok())
                        .map(OffsetDateTime::from),
                }
            })
            .collect()
    }

    /// Drop every pipeline for a configuration and delete its log tree.
    pub fn remove_config_logs(&self, config_id: &str) -> std::io::Result<()> {
        let removed: Vec<Arc<LogWriter>> = {
            let mut writers = self.writers.lock();
            let keys: Vec<_> = writers
                .keys()
                .filter(|(cfg, _)| cfg == config_id)
                .cloned()
                .collect();
            keys.into_iter().filter_map(|k| writers.remove(&k)).collect()
        };
        for writer in removed {
            writer.shutdown();
        }
        let dir = self.root.join(config_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

fn parse_line(line: &str) -> LogEntry {
    let mut parts = line.splitn(3, ' ');
    if let (Some(ts_raw), Some(tag), Some(text)) = (parts.next(), parts.next(), parts.next()) {
        if matches!(tag, "stdout" | "stderr" | "meta") {
            if let Ok(ts) = PrimitiveDateTime::parse(ts_raw, LINE_TS) {
                return LogEntry {
                    ts: Some(ts.assume_utc()),
                    stream: tag.to_string(),
                    text: text.to_string(),
                };
            }
        }
    }
    LogEntry {
        ts: None,
        stream: "stdout".to_string(),
        text: line.to_string(),
    }
}

fn list_archives(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut archives: Vec<(String, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let stem = path.file_stem()?.to_str()?.to_string();
            if path.extension()?.to_str()? == "log" && stem != CURRENT_RUN {
                Some((stem, path))
            } else {
                None
            }
        })
        .collect();
    archives.sort_by(|a, b| b.0.cmp(&a.0));
    archives
}

enum Item {
    Line { stream: &'static str, text: String },
    Archive { run_id: String, ack: oneshot::Sender<()> },
    Shutdown,
}

/// Bounded line buffer between the drain tasks and the writer task. When
/// full, the oldest buffered line is dropped and counted; the writer emits
/// a `meta` sentinel for the drops on its next write.
struct Buffer {
    queue: Mutex<BufferState>,
    capacity: usize,
    notify: Notify,
}

struct BufferState {
    items: VecDeque<Item>,
    line_count: usize,
    dropped: u64,
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(BufferState {
                items: VecDeque::new(),
                line_count: 0,
                dropped: 0,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    fn push_line(&self, stream: &'static str, text: String) {
        {
            let mut state = self.queue.lock();
            if state.line_count >= self.capacity {
                if let Some(pos) = state
                    .items
                    .iter()
                    .position(|i| matches!(i, Item::Line { .. }))
                {
                    state.items.remove(pos);
                    state.line_count -= 1;
                    state.dropped += 1;
                }
            }
            state.items.push_back(Item::Line { stream, text });
            state.line_count += 1;
        }
        self.notify.notify_one();
    }

    fn push_control(&self, item: Item) {
        self.queue.lock().items.push_back(item);
        self.notify.notify_one();
    }

    fn pop(&self) -> (Option<Item>, u64) {
        let mut state = self.queue.lock();
        let item = state.items.pop_front();
        if let Some(Item::Line { .. }) = &item {
            state.line_count -= 1;
        }
        let dropped = std::mem::take(&mut state.dropped);
        (item, dropped)
    }
}

/// Per-application pipeline: drains child stdio into `current.log`,
/// archives between runs, rotates on size. Created once per app and kept
/// for the supervisor's lifetime.
pub struct LogWriter {
    buffer: Arc<Buffer>,
}

impl LogWriter {
    fn spawn(dir: PathBuf, retention: usize, max_size_bytes: u64, capacity: usize) -> Arc<Self> {
        let buffer = Arc::new(Buffer::new(capacity));
        let task_buffer = Arc::clone(&buffer);
        tokio::spawn(async move {
            writer_task(task_buffer, dir, retention, max_size_bytes).await;
        });
        Arc::new(Self { buffer })
    }

    /// Begin consuming both child streams concurrently. Each drain task
    /// retires when its pipe reaches EOF.
    pub fn attach(
        &self,
        stdout: impl AsyncRead + Unpin + Send + 'static,
        stderr: impl AsyncRead + Unpin + Send + 'static,
    ) {
        self.spawn_drain("stdout", stdout);
        self.spawn_drain("stderr", stderr);
    }

    fn spawn_drain(&self, stream: &'static str, pipe: impl AsyncRead + Unpin + Send + 'static) {
        let buffer = Arc::clone(&self.buffer);
        tokio::spawn(async move {
            let mut lines = AsyncBufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buffer.push_line(stream, line);
            }
        });
    }

    /// Feed a line that did not come from a child pipe (build output).
    pub fn write_line(&self, stream: &'static str, text: impl Into<String>) {
        self.buffer.push_line(stream, text.into());
    }

    /// Rename `current.log` to `<run_id>.log`, prune old archives, start a
    /// fresh file. Resolves once the writer has committed the rotation.
    pub async fn archive(&self, run_id: &str) {
        let (ack, done) = oneshot::channel();
        self.buffer.push_control(Item::Archive {
            run_id: run_id.to_string(),
            ack,
        });
        let _ = done.await;
    }

    fn shutdown(&self) {
        self.buffer.push_control(Item::Shutdown);
    }
}

struct WriterState {
    dir: PathBuf,
    retention: usize,
    max_size_bytes: u64,
    file: Option<File>,
    bytes_written: u64,
    last_ts: Option<OffsetDateTime>,
}

async fn writer_task(buffer: Arc<Buffer>, dir: PathBuf, retention: usize, max_size_bytes: u64) {
    let mut state = WriterState {
        dir,
        retention,
        max_size_bytes,
        file: None,
        bytes_written: 0,
        last_ts: None,
    };
    loop {
        let notified = buffer.notify.notified();
        let (item, dropped) = buffer.pop();
        if dropped > 0 {
            state.emit(
                "meta",
                &format!("[log-pipeline: {dropped} lines dropped]"),
            );
        }
        match item {
            Some(Item::Line { stream, text }) => {
                state.emit(stream, &text);
                if state.bytes_written >= state.max_size_bytes {
                    let run_id = run_id_for(OffsetDateTime::now_utc());
                    warn!(dir = %state.dir.display(), run_id = %run_id, "log exceeded max size, rotating");
                    state.rotate(&run_id);
                }
            }
            Some(Item::Archive { run_id, ack }) => {
                state.rotate(&run_id);
                let _ = ack.send(());
            }
            Some(Item::Shutdown) => return,
            None => notified.await,
        }
    }
}

impl WriterState {
    fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{CURRENT_RUN}.log"))
    }

    fn open(&mut self) -> Option<&mut File> {
        if self.file.is_none() {
            if let Err(e) = std::fs::create_dir_all(&self.dir) {
                warn!(dir = %self.dir.display(), error = %e, "cannot create log dir");
                return None;
            }
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.current_path())
            {
                Ok(file) => {
                    self.bytes_written = file.metadata().map(|m| m.len()).unwrap_or(0);
                    self.file = Some(file);
                }
                Err(e) => {
                    warn!(dir = %self.dir.display(), error = %e, "cannot open current.log");
                    return None;
                }
            }
        }
        self.file.as_mut()
    }

    /// Timestamps are clamped monotonically non-decreasing per file.
    fn emit(&mut self, stream: &str, text: &str) {
        let mut now = OffsetDateTime::now_utc();
        if let Some(last) = self.last_ts {
            if now < last {
                now = last;
            }
        }
        self.last_ts = Some(now);
        let ts = now
            .format(LINE_TS)
            .unwrap_or_else(|_| "1970-01-01T00:00:00.000Z".to_string());
        let line = format!("{ts} {stream} {text}\n");
        let len = line.len() as u64;
        if let Some(file) = self.open() {
            if let Err(e) = file.write_all(line.as_bytes()) {
                warn!(error = %e, "log write failed");
                return;
            }
            self.bytes_written += len;
        }
    }

    fn rotate(&mut self, run_id: &str) {
        self.file = None;
        self.bytes_written = 0;
        self.last_ts = None;

        let current = self.current_path();
        let has_content = std::fs::metadata(&current).map(|m| m.len() > 0).unwrap_or(false);
        if has_content {
            let mut target = self.dir.join(format!("{run_id}.log"));
            let mut suffix = 1;
            while target.exists() {
                target = self.dir.join(format!("{run_id}-{suffix}.log"));
                suffix += 1;
            }
            if let Err(e) = std::fs::rename(&current, &target) {
                warn!(error = %e, "failed to archive current.log");
                return;
            }
            debug!(target = %target.display(), "archived log run");
            self.prune();
        }
    }

    fn prune(&self) {
        let archives = list_archives(&self.dir);
        for (_, path) in archives.iter().skip(self.retention) {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to delete old log run");
            } else {
                debug!(path = %path.display(), "deleted old log run");
            }
        }
    }
}
