//! Mock backend and transport shared by unit tests

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::backend::{AudioPipe, Pipeline, Receiver};
use crate::session::{ResponseHead, Transport};

/// Ordered record of backend calls
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    /// Drain recorded calls
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

/// Receiver backed by a real pipe
pub struct MockReceiver {
    label: &'static str,
    ready: AtomicBool,
    running: AtomicBool,
    pipe: Option<AudioPipe>,
    log: CallLog,
}

impl MockReceiver {
    pub fn new(label: &'static str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            label,
            ready: AtomicBool::new(true),
            running: AtomicBool::new(false),
            pipe: Some(AudioPipe::new().unwrap()),
            log: log.clone(),
        })
    }

    pub fn not_ready(label: &'static str, log: &CallLog) -> Arc<Self> {
        let receiver = Self::new(label, log);
        receiver.ready.store(false, Ordering::SeqCst);
        receiver
    }

    pub fn without_fd(label: &'static str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            label,
            ready: AtomicBool::new(true),
            running: AtomicBool::new(false),
            pipe: None,
            log: log.clone(),
        })
    }

    /// Receiver whose pipe writer has already gone away
    pub fn hung_up(label: &'static str, log: &CallLog) -> Arc<Self> {
        let mut pipe = AudioPipe::new().unwrap();
        pipe.close_write();
        Arc::new(Self {
            label,
            ready: AtomicBool::new(true),
            running: AtomicBool::new(false),
            pipe: Some(pipe),
            log: log.clone(),
        })
    }

    pub fn pipe(&self) -> &AudioPipe {
        self.pipe.as_ref().unwrap()
    }
}

impl Receiver for MockReceiver {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.log.push(format!("{}.start", self.label));
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.log.push(format!("{}.stop", self.label));
    }

    fn fd(&self) -> Option<RawFd> {
        self.pipe.as_ref().map(|p| p.read_fd())
    }
}

/// Pipeline counting start/stop calls
pub struct MockPipeline {
    starts: AtomicUsize,
    stops: AtomicUsize,
    log: CallLog,
}

impl MockPipeline {
    pub fn new(log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            log: log.clone(),
        })
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Pipeline for MockPipeline {
    fn lock(&self) {
        self.log.push("lock");
    }

    fn unlock(&self) {
        self.log.push("unlock");
    }

    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.log.push("pipeline.start");
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.log.push("pipeline.stop");
    }

    fn wait(&self) {
        self.log.push("pipeline.wait");
    }
}

/// Transport recording everything written to it
#[derive(Debug, Default)]
pub struct MockTransport {
    pub statuses: Vec<u16>,
    pub heads: Vec<ResponseHead>,
    pub body: Vec<u8>,
    pub timeouts: Vec<Duration>,
    pub fail_writes: bool,
    pub close_after_transaction: bool,
    /// Accept at most this many body bytes per write
    pub max_write: Option<usize>,
}

impl Transport for MockTransport {
    fn respond_status(&mut self, status: u16) {
        self.statuses.push(status);
    }

    fn write_head(&mut self, head: &ResponseHead) -> io::Result<()> {
        if self.fail_writes {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.heads.push(head.clone());
        Ok(())
    }

    fn write_body(&mut self, data: Bytes) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let accepted = self.max_write.map_or(data.len(), |max| data.len().min(max));
        self.body.extend_from_slice(&data[..accepted]);
        Ok(accepted)
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeouts.push(timeout);
    }

    fn transaction_completed(&mut self) -> bool {
        self.close_after_transaction
    }
}

/// Route test logs through tracing-subscriber; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
