//! Wire and header logging.
//!
//! # Design
//! When enabled, `Wire` copies every payload byte that goes out or comes in
//! to a `WireSink` without changing what the real consumer reads. In-memory
//! payloads and small files or streams are logged in one piece. Larger
//! files are read a second time and streams are wrapped in a tee reader;
//! if the wire was given a runtime handle the copies are drained on that
//! runtime's blocking pool, otherwise they are logged as they are read.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::debug;

use crate::config::ExecutorConfig;
use crate::http::{HttpRequest, HttpResponse};
use crate::payload::{BoxedReader, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Output,
    Input,
}

impl Direction {
    pub fn prefix(&self) -> &'static str {
        match self {
            Direction::Output => ">>",
            Direction::Input => "<<",
        }
    }
}

/// Destination for wire bytes.
pub trait WireSink: Send + Sync {
    fn write(&self, direction: Direction, bytes: &[u8]);
}

/// Logs wire bytes at debug level on the `cloudhttp::wire` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl WireSink for TracingSink {
    fn write(&self, direction: Direction, bytes: &[u8]) {
        debug!(target: "cloudhttp::wire", "{} \"{}\"", direction.prefix(), String::from_utf8_lossy(bytes));
    }
}

#[derive(Clone)]
pub struct Wire {
    enabled: bool,
    sink: Arc<dyn WireSink>,
    runtime: Option<Handle>,
    buffer_threshold: u64,
}

impl Wire {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            sink: Arc::new(TracingSink),
            runtime: None,
            buffer_threshold: 0,
        }
    }

    pub fn new(sink: Arc<dyn WireSink>) -> Self {
        Self {
            enabled: true,
            sink,
            runtime: None,
            buffer_threshold: ExecutorConfig::default().wire_buffer_threshold,
        }
    }

    /// Tracing-backed wire if `wire_log` is set, otherwise disabled.
    pub fn from_config(config: &ExecutorConfig) -> Self {
        if !config.wire_log {
            return Self::disabled();
        }
        Self::new(Arc::new(TracingSink)).with_buffer_threshold(config.wire_buffer_threshold)
    }

    /// Drain teed streams on this runtime's blocking pool.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn with_buffer_threshold(mut self, threshold: u64) -> Self {
        self.buffer_threshold = threshold;
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn output(&self, request: &mut HttpRequest) -> io::Result<()> {
        match request.payload.as_mut() {
            Some(payload) if self.enabled => self.tee(Direction::Output, payload),
            _ => Ok(()),
        }
    }

    pub fn input(&self, response: &mut HttpResponse) -> io::Result<()> {
        match response.payload.as_mut() {
            Some(payload) if self.enabled => self.tee(Direction::Input, payload),
            _ => Ok(()),
        }
    }

    fn tee(&self, direction: Direction, payload: &mut Payload) -> io::Result<()> {
        if let Some(bytes) = payload.as_bytes() {
            self.sink.write(direction, bytes);
            return Ok(());
        }
        let small = payload
            .metadata()
            .content_length
            .is_some_and(|len| len <= self.buffer_threshold);

        if let Some(path) = payload.file_path() {
            if small {
                self.sink.write(direction, &std::fs::read(path)?);
            } else {
                self.drain_file(direction, path.to_path_buf());
            }
            return Ok(());
        }

        if small {
            let bytes = payload.buffer()?;
            self.sink.write(direction, &bytes);
            return Ok(());
        }

        let side = match &self.runtime {
            Some(handle) => {
                let (tx, rx) = mpsc::channel::<Vec<u8>>();
                let sink = self.sink.clone();
                handle.spawn_blocking(move || {
                    for chunk in rx {
                        sink.write(direction, &chunk);
                    }
                });
                Side::Channel(tx)
            }
            None => Side::Inline(self.sink.clone(), direction),
        };
        payload.wrap_stream(|inner| Box::new(TeeReader { inner, side }) as BoxedReader)
    }

    fn drain_file(&self, direction: Direction, path: PathBuf) {
        let sink = self.sink.clone();
        let drain = move || {
            let Ok(mut file) = File::open(&path) else {
                return;
            };
            let mut buf = vec![0u8; 8192];
            while let Ok(n) = file.read(&mut buf) {
                if n == 0 {
                    break;
                }
                sink.write(direction, &buf[..n]);
            }
        };
        match &self.runtime {
            Some(handle) => {
                handle.spawn_blocking(drain);
            }
            None => drain(),
        }
    }
}

enum Side {
    Inline(Arc<dyn WireSink>, Direction),
    Channel(Sender<Vec<u8>>),
}

/// Copies what the consumer reads to the wire side channel.
struct TeeReader {
    inner: BoxedReader,
    side: Side,
}

impl Read for TeeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            match &self.side {
                Side::Inline(sink, direction) => sink.write(*direction, &buf[..n]),
                // the drain task only goes away with the runtime
                Side::Channel(tx) => {
                    let _ = tx.send(buf[..n].to_vec());
                }
            }
        }
        Ok(n)
    }
}

/// Log the request line, headers and payload metadata.
pub fn log_request(request: &HttpRequest) {
    debug!(target: "cloudhttp::headers", ">> {}", request.request_line());
    log_headers(">>", &request.headers, request.payload.as_ref());
}

/// Log the status line, headers and payload metadata.
pub fn log_response(response: &HttpResponse) {
    debug!(target: "cloudhttp::headers", "<< {}", response.status_line());
    log_headers("<<", &response.headers, response.payload.as_ref());
}

fn log_headers(prefix: &str, headers: &[(String, String)], payload: Option<&Payload>) {
    for (name, value) in headers {
        debug!(target: "cloudhttp::headers", "{prefix} {name}: {value}");
    }
    if let Some(payload) = payload {
        for (name, value) in payload.metadata_headers() {
            debug!(target: "cloudhttp::headers", "{prefix} {name}: {value}");
        }
    }
}
