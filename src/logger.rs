//! Asynchronous structured logger with a synchronous dual-sink escape hatch.
//!
//! # Architecture
//!
//! ```text
//!   producers (workers, tracker, graph)          consumer thread
//!        |                                            |
//!        |  log(level, event, status, ...)            |
//!        +----> channel (MPSC) ---------------------->+  drain <= 50 records
//!        |                                            |  format JSON lines
//!        |  dual_safe_log(msg)                        |  write file, flush
//!        +----> stdout + file, synchronously          |  echo console (opt-in)
//! ```
//!
//! Producers never touch the log file: [`LogHandle::log`] stamps the record
//! with the current wall clock and a dense `thread#N` label and enqueues it.
//! A single consumer thread drains the queue in batches of up to
//! [`BATCH`] records, formats each as a one-line JSON object, and writes the
//! batch to the file (and to the console when record echo is enabled).
//!
//! [`LogHandle::dual_safe_log`] bypasses the queue for progress/UX lines
//! that must not lag: it writes a plain timestamped line to both stdout and
//! the file under their own mutexes.
//!
//! `stop()` signals shutdown, drains the queue fully, joins the consumer and
//! flushes. A file write failure is reported to stderr and the file sink is
//! dropped; queued records keep flowing to the console sink.
//!
//! The logger is an explicit instance: create one, pass [`LogHandle`] clones
//! to collaborators. There is no process-wide singleton.

use ahash::AHashMap;
use chrono::{DateTime, Local};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

/// Maximum records drained per consumer wakeup.
pub const BATCH: usize = 50;

/// Severity of a structured record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Canonical name used in JSON records.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    /// Fixed-width tag for console echo lines.
    fn console_tag(self) -> &'static str {
        match self {
            LogLevel::Debug => "DBG ",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERR ",
        }
    }
}

/// One structured record, stamped at enqueue time.
#[derive(Clone, Debug)]
pub struct LogRecord {
    /// Wall-clock time the producer enqueued the record.
    pub timestamp: DateTime<Local>,
    /// Dense `thread#N` label of the producing thread.
    pub thread_label: String,
    /// Severity.
    pub level: LogLevel,
    /// What happened, e.g. `job:fetch-42`.
    pub event: String,
    /// Outcome tag, e.g. `ok`, `failed`, `timeout`.
    pub status: String,
    /// Latency associated with the event, in ms.
    pub latency_ms: u64,
    /// 1-based attempt number, 0 when not applicable.
    pub attempt: u32,
}

impl LogRecord {
    /// Single-line JSON object form, the file sink format.
    fn to_json_line(&self) -> String {
        format!(
            "{{ \"timestamp\": \"{}\", \"thread_id\": \"{}\", \"level\": \"{}\", \
             \"event\": \"{}\", \"status\": \"{}\", \"latency_ms\": {}, \"attempt\": {} }}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.thread_label,
            self.level.as_str(),
            escape_json(&self.event),
            escape_json(&self.status),
            self.latency_ms,
            self.attempt,
        )
    }

    /// Human-readable console echo form.
    fn to_console_line(&self) -> String {
        format!(
            "[{}]  [{}]  [{}]  [{}]  latency = {}ms  attempt = {}  {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level.console_tag(),
            self.event,
            self.status,
            self.latency_ms,
            self.attempt,
            self.thread_label,
        )
    }
}

enum Command {
    Record(LogRecord),
    Shutdown,
}

/// Dense thread labels: OS thread id -> `thread#N`, N starting at 1.
struct ThreadLabels {
    map: Mutex<AHashMap<ThreadId, u32>>,
    next: AtomicU32,
}

impl ThreadLabels {
    fn new() -> Self {
        Self {
            map: Mutex::new(AHashMap::new()),
            next: AtomicU32::new(1),
        }
    }

    fn label_for_current(&self) -> String {
        let id = thread::current().id();
        let mut map = self.map.lock().expect("thread label mutex poisoned");
        let n = *map
            .entry(id)
            .or_insert_with(|| self.next.fetch_add(1, Ordering::Relaxed));
        format!("thread#{n}")
    }
}

/// State shared between producers, the consumer, and `dual_safe_log`.
struct SinkShared {
    /// File sink. `None` after open failure fallback or a write error.
    file: Mutex<Option<File>>,
    /// Serializes console output so lines never interleave.
    console: Mutex<()>,
    /// Echo batched records to the console in human form.
    echo_records: AtomicBool,
    labels: ThreadLabels,
}

impl SinkShared {
    /// Write one already-formatted line to the file sink, dropping the sink
    /// on error. The caller holds no other sink lock.
    fn write_file_lines(&self, lines: &str) {
        let mut guard = self.file.lock().expect("log file mutex poisoned");
        if let Some(file) = guard.as_mut() {
            let res = file.write_all(lines.as_bytes()).and_then(|_| file.flush());
            if let Err(e) = res {
                eprintln!("jobforge logger: log file write failed, keeping console only: {e}");
                *guard = None;
            }
        }
    }

    fn write_console(&self, text: &str) {
        let _guard = self.console.lock().expect("console mutex poisoned");
        println!("{text}");
    }
}

/// The owning side of the logger: holds the consumer thread.
///
/// Dropping the logger performs a best-effort `stop()`.
pub struct Logger {
    tx: Sender<Command>,
    consumer: Option<JoinHandle<()>>,
    shared: Arc<SinkShared>,
}

impl Logger {
    /// Open the log file, spawn the consumer thread, and block until the
    /// consumer signals ready, then write the start banner.
    ///
    /// `truncate` selects overwrite vs append mode.
    ///
    /// # Errors
    ///
    /// Returns the underlying `io::Error` when the file cannot be opened.
    pub fn start(path: impl AsRef<Path>, truncate: bool) -> io::Result<Logger> {
        let file = if truncate {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path.as_ref())?
        } else {
            OpenOptions::new().create(true).append(true).open(path.as_ref())?
        };

        let shared = Arc::new(SinkShared {
            file: Mutex::new(Some(file)),
            console: Mutex::new(()),
            echo_records: AtomicBool::new(false),
            labels: ThreadLabels::new(),
        });

        let (tx, rx) = unbounded::<Command>();
        let (ready_tx, ready_rx) = bounded::<()>(1);

        let consumer_shared = Arc::clone(&shared);
        let consumer = thread::Builder::new()
            .name("jobforge-logger".to_string())
            .spawn(move || {
                let _ = ready_tx.send(());
                consumer_loop(rx, consumer_shared);
            })
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        // Producers may start logging the moment they get a handle; wait for
        // the consumer before handing any out.
        let _ = ready_rx.recv();

        let logger = Logger {
            tx,
            consumer: Some(consumer),
            shared,
        };
        logger
            .handle()
            .dual_safe_log(&format!("=== Job run started at {}", now_stamp()));
        Ok(logger)
    }

    /// Cheap cloneable producer handle.
    pub fn handle(&self) -> LogHandle {
        LogHandle {
            tx: Some(self.tx.clone()),
            shared: Some(Arc::clone(&self.shared)),
        }
    }

    /// Echo batched records to the console in human form (off by default;
    /// `dual_safe_log` lines always reach the console).
    pub fn set_echo_records(&self, on: bool) {
        self.shared.echo_records.store(on, Ordering::Relaxed);
    }

    /// Signal shutdown, drain the queue fully, join the consumer, flush.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            let _ = self.tx.send(Command::Shutdown);
            let _ = consumer.join();
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Producer handle. Clone freely; a null handle swallows everything, which
/// keeps logging optional for library embedders and tests.
#[derive(Clone)]
pub struct LogHandle {
    tx: Option<Sender<Command>>,
    shared: Option<Arc<SinkShared>>,
}

impl LogHandle {
    /// A handle that discards all output.
    pub fn null() -> LogHandle {
        LogHandle {
            tx: None,
            shared: None,
        }
    }

    /// Whether this handle is connected to a running logger.
    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    /// Enqueue a structured record. Never blocks on I/O.
    pub fn log(&self, level: LogLevel, event: &str, status: &str, latency_ms: u64, attempt: u32) {
        let (Some(tx), Some(shared)) = (&self.tx, &self.shared) else {
            return;
        };
        let record = LogRecord {
            timestamp: Local::now(),
            thread_label: shared.labels.label_for_current(),
            level,
            event: event.to_string(),
            status: status.to_string(),
            latency_ms,
            attempt,
        };
        let _ = tx.send(Command::Record(record));
    }

    /// Write a plain timestamped line synchronously to both console and
    /// file. For progress/UX lines that must not lag behind the queue.
    pub fn dual_safe_log(&self, message: &str) {
        let Some(shared) = &self.shared else {
            return;
        };
        let full = format!("[{}]  ===  {message}", now_stamp());
        shared.write_console(&full);
        shared.write_file_lines(&format!("{full}\n"));
    }
}

fn now_stamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn consumer_loop(rx: Receiver<Command>, shared: Arc<SinkShared>) {
    loop {
        match rx.recv() {
            Ok(Command::Record(first)) => {
                let mut batch = Vec::with_capacity(BATCH);
                batch.push(first);
                let mut stopping = false;
                while batch.len() < BATCH {
                    match rx.try_recv() {
                        Ok(Command::Record(r)) => batch.push(r),
                        Ok(Command::Shutdown) => {
                            stopping = true;
                            break;
                        }
                        Err(_) => break,
                    }
                }
                flush_batch(&shared, &batch);
                if stopping {
                    drain_remaining(&rx, &shared);
                    return;
                }
            }
            Ok(Command::Shutdown) => {
                drain_remaining(&rx, &shared);
                return;
            }
            // All producers dropped without an explicit stop.
            Err(_) => return,
        }
    }
}

/// On shutdown the queue is drained fully; no record is lost.
fn drain_remaining(rx: &Receiver<Command>, shared: &SinkShared) {
    let mut batch = Vec::with_capacity(BATCH);
    while let Ok(cmd) = rx.try_recv() {
        if let Command::Record(r) = cmd {
            batch.push(r);
            if batch.len() == BATCH {
                flush_batch(shared, &batch);
                batch.clear();
            }
        }
    }
    if !batch.is_empty() {
        flush_batch(shared, &batch);
    }
}

fn flush_batch(shared: &SinkShared, batch: &[LogRecord]) {
    let mut lines = String::new();
    for record in batch {
        lines.push_str(&record.to_json_line());
        lines.push('\n');
    }
    shared.write_file_lines(&lines);

    if shared.echo_records.load(Ordering::Relaxed) {
        let _guard = shared.console.lock().expect("console mutex poisoned");
        for record in batch {
            println!("{}", record.to_console_line());
        }
    }
}

/// Escape a string for embedding in a JSON string literal.
///
/// `\" \\ \b \f \n \r \t` get their short escapes; any other control char
/// or char above `0x7E` becomes `\uXXXX` (chars beyond the BMP as a UTF-16
/// surrogate pair), so the emitted records are pure ASCII.
pub fn escape_json(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || (c as u32) > 0x7E => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    out.push_str(&format!("\\u{:04X}", unit));
                }
            }
            c => out.push(c),
        }
    }
    out
}
