// File: devstack/src/process/output.rs
//
// Combined stdout/stderr capture for one supervised process: bounded
// in-memory tail, optional log file written by a dedicated task, and signal
// extraction on every line.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::signal::{SignalBoard, SignalExtractor};
use super::ProcessRole;

/// Default number of output lines kept in memory per process.
pub const DEFAULT_TAIL_LINES: usize = 1000;

/// Where a process' combined output goes.
#[derive(Debug, Clone)]
pub struct LogSink {
    /// Persist output to this file (parent directories are created)
    pub file: Option<PathBuf>,
    /// Number of most recent lines kept in memory
    pub tail_lines: usize,
}

impl LogSink {
    /// Memory only.
    pub fn memory() -> Self {
        Self {
            file: None,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn with_tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines;
        self
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::memory()
    }
}

pub(crate) struct OutputCapture {
    role: ProcessRole,
    tail: Mutex<VecDeque<String>>,
    tail_lines: usize,
    extractors: Vec<Arc<dyn SignalExtractor>>,
    signals: SignalBoard,
    file_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl OutputCapture {
    pub(crate) fn new(
        role: ProcessRole,
        sink: &LogSink,
        extractors: Vec<Arc<dyn SignalExtractor>>,
    ) -> Self {
        Self {
            role,
            tail: Mutex::new(VecDeque::with_capacity(sink.tail_lines.min(DEFAULT_TAIL_LINES))),
            tail_lines: sink.tail_lines,
            extractors,
            signals: SignalBoard::new(),
            file_tx: Mutex::new(None),
        }
    }

    /// Opens the log file and starts its writer task.
    ///
    /// Lines are handed to the writer over an unbounded channel so that a slow
    /// disk never stalls the output readers or the readiness probes.
    pub(crate) async fn open_file(&self, path: &Path) -> std::io::Result<JoinHandle<()>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::File::create(path).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.file_tx.lock() = Some(tx);

        if log::log_enabled!(log::Level::Debug) {
            log::debug!("Writing {} output to {}", self.role, path.display());
        }
        Ok(tokio::spawn(write_lines(file, rx, path.to_path_buf())))
    }

    /// Stops feeding the log file; the writer flushes and exits.
    pub(crate) fn close_file(&self) {
        self.file_tx.lock().take();
    }

    pub(crate) fn ingest(&self, line: &str, previous: Option<&str>) {
        for extractor in &self.extractors {
            if self.signals.contains(extractor.name()) {
                continue;
            }
            if let Some(value) = extractor.extract(line, previous) {
                if log::log_enabled!(log::Level::Debug) {
                    log::debug!("{} signal {} = {}", self.role, extractor.name(), value);
                }
                self.signals.insert_once(extractor.name(), value);
            }
        }

        if let Some(tx) = self.file_tx.lock().as_ref() {
            // The writer only goes away after close_file
            let _ = tx.send(line.to_string());
        }

        if self.tail_lines > 0 {
            let mut tail = self.tail.lock();
            if tail.len() == self.tail_lines {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        }
    }

    pub(crate) fn signals(&self) -> SignalBoard {
        self.signals.clone()
    }

    pub(crate) fn tail(&self, lines: usize) -> Vec<String> {
        let tail = self.tail.lock();
        let skip = tail.len().saturating_sub(lines);
        tail.iter().skip(skip).cloned().collect()
    }
}

async fn write_lines(file: fs::File, mut rx: mpsc::UnboundedReceiver<String>, path: PathBuf) {
    let mut writer = BufWriter::new(file);
    while let Some(line) = rx.recv().await {
        let mut result = write_line(&mut writer, &line).await;
        // Drain whatever is already queued before paying for a flush
        while result.is_ok() {
            match rx.try_recv() {
                Ok(line) => result = write_line(&mut writer, &line).await,
                Err(_) => break,
            }
        }
        if let Err(e) = result.and(writer.flush().await) {
            log::warn!("Failed writing log file {}: {}", path.display(), e);
            return;
        }
    }
    if let Err(e) = writer.flush().await {
        log::warn!("Failed flushing log file {}: {}", path.display(), e);
    }
}

async fn write_line(writer: &mut BufWriter<fs::File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

/// Reads `stream` line by line into `capture` until EOF.
///
/// Bytes that are not valid UTF-8 are replaced, never dropped: the pipe must
/// keep draining whatever the process prints.
pub(crate) fn spawn_reader<R>(stream: R, capture: Arc<OutputCapture>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        let mut previous: Option<String> = None;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&buf);
                    capture.ingest(&line, previous.as_deref());
                    previous = Some(line);
                }
                Err(e) => {
                    log::debug!("{} output stream closed: {}", capture.role, e);
                    break;
                }
            }
        }
    })
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
