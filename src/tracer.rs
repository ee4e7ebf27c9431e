//! Buffered thread-control event tracer.
//!
//! Records the life of guest threads and every control request with minimal
//! impact on the threads being traced: messages are formatted only when the
//! tracer is enabled and not filtered, then handed to a background writer over
//! a bounded channel.
//!
//! ## Environment Variables
//!
//! - `THREADCTL_TRACE`: Enable tracing
//!   - `"1"`, `"true"`, or `"stdout"`: Write to stdout
//!   - `"stderr"`: Write to stderr
//!   - `<path>`: Write to file at path
//!
//! - `THREADCTL_TRACE_FLUSH_INTERVAL`: Number of messages before auto-flush (default: 10000)
//!
//! - `THREADCTL_TRACE_FORMAT`: Output format (`"text"` or `"json"`, default: `"text"`)
//!
//! - `THREADCTL_TRACE_LEVEL`: Minimum trace level to output
//!   - `"error"`: Only errors
//!   - `"info"`: Lifecycle and control requests
//!   - `"debug"`: Deliveries, suspension and state changes
//!   - `"trace"`: Everything, including every safepoint poll (default)
use crate::threading::ThreadHandle;
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::File,
    io::{stderr, stdout, BufWriter, Write},
    thread::{self, JoinHandle},
    time::Instant,
};

const BUFFER_SIZE: usize = 64 * 1024;
const AUTO_FLUSH_INTERVAL: usize = 10_000; // Auto-flush every N messages
const CHANNEL_CAPACITY: usize = 10_000; // Channel capacity for trace messages

/// Trace level for filtering messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Error = 0,
    Info = 1,
    Debug = 2,
    Trace = 3,
}

impl TraceLevel {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "error" => Some(Self::Error),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

/// Output format for trace messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFormat {
    Text,
    Json,
}

impl TraceFormat {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// `stdout`/`1`/`true`, `stderr`, or a file path.
fn open_sink(target: &str) -> Option<Box<dyn Write + Send>> {
    match target {
        "" => None,
        "1" | "true" | "stdout" => Some(Box::new(stdout())),
        "stderr" => Some(Box::new(stderr())),
        path => match File::create(path) {
            Ok(file) => Some(Box::new(file)),
            Err(e) => {
                tracing::warn!("cannot open trace file {}: {}", path, e);
                None
            }
        },
    }
}

#[derive(Debug)]
enum TraceMessage {
    Message {
        level: TraceLevel,
        text: String,
        metadata: MessageMetadata,
    },
    Flush,
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<u64>,
    timestamp_us: u64,
}

pub struct Tracer {
    sender: Option<Sender<TraceMessage>>,
    writer_thread: Option<JoinHandle<()>>,
    min_level: TraceLevel,
    epoch: Instant,
    message_count: usize,
}

impl Tracer {
    /// A tracer that drops everything.
    pub fn disabled() -> Self {
        Self {
            sender: None,
            writer_thread: None,
            min_level: TraceLevel::Error,
            epoch: Instant::now(),
            message_count: 0,
        }
    }

    pub fn from_env() -> Self {
        let Some(writer) = env::var("THREADCTL_TRACE").ok().and_then(|v| open_sink(&v)) else {
            return Self::disabled();
        };
        let flush_every = env::var("THREADCTL_TRACE_FLUSH_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(AUTO_FLUSH_INTERVAL);
        let format = env::var("THREADCTL_TRACE_FORMAT")
            .ok()
            .and_then(|v| TraceFormat::parse(&v))
            .unwrap_or(TraceFormat::Text);
        let min_level = env::var("THREADCTL_TRACE_LEVEL")
            .ok()
            .and_then(|v| TraceLevel::parse(&v))
            .unwrap_or(TraceLevel::Trace);

        Self::with_writer(writer, format, min_level, flush_every)
    }

    pub fn with_writer(
        writer: Box<dyn Write + Send>,
        format: TraceFormat,
        min_level: TraceLevel,
        auto_flush_interval: usize,
    ) -> Self {
        let (tx, rx) = bounded(CHANNEL_CAPACITY);
        let sink = TraceSink {
            out: BufWriter::with_capacity(BUFFER_SIZE, writer),
            format,
            flush_every: auto_flush_interval.max(1),
            unflushed: 0,
        };
        let spawned = thread::Builder::new()
            .name("threadctl-trace".to_owned())
            .spawn(move || sink.run(rx));
        match spawned {
            Ok(handle) => Self {
                sender: Some(tx),
                writer_thread: Some(handle),
                min_level,
                epoch: Instant::now(),
                message_count: 0,
            },
            Err(e) => {
                tracing::warn!("trace writer thread failed to start: {}", e);
                Self::disabled()
            }
        }
    }

    #[inline(always)]
    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    pub fn message_count(&self) -> usize {
        self.message_count
    }

    fn write_msg(
        &mut self,
        level: TraceLevel,
        thread_id: Option<ThreadHandle>,
        args: std::fmt::Arguments,
    ) {
        if level > self.min_level {
            return;
        }

        if let Some(ref sender) = self.sender {
            let metadata = MessageMetadata {
                thread_id: thread_id.map(ThreadHandle::as_u64),
                timestamp_us: self.epoch.elapsed().as_micros() as u64,
            };
            // Blocking send: a full channel means the writer cannot keep up, and
            // losing control events would make the trace useless.
            let _ = sender.send(TraceMessage::Message {
                level,
                text: format!("{}", args),
                metadata,
            });
            self.message_count += 1;
        }
    }

    pub fn flush(&mut self) {
        if let Some(ref sender) = self.sender {
            let _ = sender.try_send(TraceMessage::Flush);
        }
    }

    pub fn trace_thread_create(&mut self, thread_id: ThreadHandle, name: &str) {
        if !self.is_enabled() {
            return;
        }
        self.write_msg(
            TraceLevel::Info,
            Some(thread_id),
            format_args!("⚙ THREAD CREATE [ID:{}] \"{}\"", thread_id, name),
        );
    }

    pub fn trace_thread_start(&mut self, thread_id: ThreadHandle) {
        if !self.is_enabled() {
            return;
        }
        self.write_msg(
            TraceLevel::Info,
            Some(thread_id),
            format_args!("⚙ THREAD START [ID:{}]", thread_id),
        );
    }

    pub fn trace_thread_exit(&mut self, thread_id: ThreadHandle) {
        if !self.is_enabled() {
            return;
        }
        self.write_msg(
            TraceLevel::Info,
            Some(thread_id),
            format_args!("⚙ THREAD EXIT [ID:{}]", thread_id),
        );
    }

    pub fn trace_thread_stillborn(&mut self, thread_id: ThreadHandle) {
        if !self.is_enabled() {
            return;
        }
        self.write_msg(
            TraceLevel::Info,
            Some(thread_id),
            format_args!("⚙ THREAD STILLBORN [ID:{}]", thread_id),
        );
    }

    pub fn trace_thread_safepoint(&mut self, thread_id: ThreadHandle, location: &str) {
        if !self.is_enabled() {
            return;
        }
        self.write_msg(
            TraceLevel::Trace,
            Some(thread_id),
            format_args!("⚙ THREAD SAFEPOINT [ID:{}] at {}", thread_id, location),
        );
    }

    pub fn trace_thread_state(&mut self, thread_id: ThreadHandle, old_state: &str, new_state: &str) {
        if !self.is_enabled() {
            return;
        }
        self.write_msg(
            TraceLevel::Debug,
            Some(thread_id),
            format_args!(
                "⚙ THREAD STATE [ID:{}] {} → {}",
                thread_id, old_state, new_state
            ),
        );
    }

    pub fn trace_control_request(&mut self, thread_id: ThreadHandle, request: &str, outcome: &str) {
        if !self.is_enabled() {
            return;
        }
        self.write_msg(
            TraceLevel::Info,
            Some(thread_id),
            format_args!("⚙ CONTROL {} [ID:{}] ({})", request, thread_id, outcome),
        );
    }

    pub fn trace_control_delivered(&mut self, thread_id: ThreadHandle, signal: &str) {
        if !self.is_enabled() {
            return;
        }
        self.write_msg(
            TraceLevel::Debug,
            Some(thread_id),
            format_args!("⚙ DELIVER [ID:{}] {}", thread_id, signal),
        );
    }

    pub fn trace_thread_suspend(&mut self, thread_id: ThreadHandle) {
        if !self.is_enabled() {
            return;
        }
        self.write_msg(
            TraceLevel::Debug,
            Some(thread_id),
            format_args!("⚙ THREAD SUSPEND [ID:{}]", thread_id),
        );
    }

    pub fn trace_thread_resume(&mut self, thread_id: ThreadHandle, suspended_us: u64) {
        if !self.is_enabled() {
            return;
        }
        self.write_msg(
            TraceLevel::Debug,
            Some(thread_id),
            format_args!(
                "⚙ THREAD RESUME [ID:{}] after {} μs",
                thread_id, suspended_us
            ),
        );
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        // If sending fails, the writer already exited and there is nothing to flush.
        if let Some(ref sender) = self.sender {
            let _ = sender.send(TraceMessage::Shutdown);
        }
        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Writer half of the tracer, owned by the background thread.
struct TraceSink {
    out: BufWriter<Box<dyn Write + Send>>,
    format: TraceFormat,
    flush_every: usize,
    unflushed: usize,
}

impl TraceSink {
    fn run(mut self, rx: Receiver<TraceMessage>) {
        for msg in rx {
            match msg {
                TraceMessage::Message {
                    level,
                    text,
                    metadata,
                } => {
                    self.write_event(level, &text, &metadata);
                    self.unflushed += 1;
                    if self.unflushed >= self.flush_every {
                        self.flush();
                    }
                }
                TraceMessage::Flush => self.flush(),
                TraceMessage::Shutdown => break,
            }
        }
        self.flush();
    }

    fn write_event(&mut self, level: TraceLevel, text: &str, metadata: &MessageMetadata) {
        // Write errors are dropped; tracing never fails the traced thread
        let _ = match self.format {
            TraceFormat::Text => writeln!(self.out, "{}", text),
            TraceFormat::Json => {
                let event = serde_json::json!({
                    "level": level,
                    "message": text,
                    "metadata": metadata,
                });
                writeln!(self.out, "{}", event)
            }
        };
    }

    fn flush(&mut self) {
        let _ = self.out.flush();
        self.unflushed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_level_filtering() {
        let buf = SharedBuf::default();
        let mut tracer = Tracer::with_writer(
            Box::new(buf.clone()),
            TraceFormat::Text,
            TraceLevel::Info,
            AUTO_FLUSH_INTERVAL,
        );
        let id = ThreadHandle::new(42);
        tracer.trace_thread_create(id, "worker");
        tracer.trace_thread_safepoint(id, "loop");
        assert_eq!(tracer.message_count(), 1);
        drop(tracer);

        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(out.contains("THREAD CREATE [ID:42] \"worker\""));
        assert!(!out.contains("SAFEPOINT"));
    }

    #[test]
    fn test_json_format() {
        let buf = SharedBuf::default();
        let mut tracer = Tracer::with_writer(
            Box::new(buf.clone()),
            TraceFormat::Json,
            TraceLevel::Trace,
            AUTO_FLUSH_INTERVAL,
        );
        tracer.trace_control_request(ThreadHandle::new(7), "STOP", "queued");
        drop(tracer);

        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let line: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(line["level"], "info");
        assert_eq!(line["metadata"]["thread_id"], 7);
    }

    #[test]
    fn test_default_tracer_is_disabled() {
        let tracer = Tracer::default();
        assert!(!tracer.is_enabled());
    }

    #[test]
    fn test_disabled_tracer_records_nothing() {
        let mut tracer = Tracer::disabled();
        tracer.trace_thread_exit(ThreadHandle::new(1));
        assert!(!tracer.is_enabled());
        assert_eq!(tracer.message_count(), 0);
    }
}
