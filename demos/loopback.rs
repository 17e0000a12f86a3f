//! Loopback stream server
//!
//! Run with: cargo run --example loopback [BIND_ADDR]
//!
//! Serves two fake streams backed by a worker thread that writes dummy Ogg
//! pages into each running receiver's pipe:
//!
//!   curl -s http://127.0.0.1:8073/streams/abcdefgh.ogg | xxd | head
//!   curl -s http://127.0.0.1:8073/streams/radio-01.ogg | xxd | head
//!
//! A second concurrent request for the same stream gets a 404.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use ogg_mux::session::{ResponseHead, SessionId};
use ogg_mux::{
    AudioPipe, Disposition, HttpEvent, Multiplexer, MuxConfig, Pipeline, Readiness, Receiver,
    Session, StreamName, StreamRegistry, Transport,
};
use tracing_subscriber::EnvFilter;

/// Receiver producing a numbered dummy page per pipeline tick
struct ToneReceiver {
    pipe: AudioPipe,
    running: AtomicBool,
    page: AtomicU32,
}

impl ToneReceiver {
    fn new() -> io::Result<Arc<Self>> {
        let pipe = AudioPipe::new()?;
        // Drop pages instead of blocking the worker when nobody drains the pipe
        // SAFETY: fcntl on a descriptor owned by `pipe`.
        unsafe {
            let flags = libc::fcntl(pipe.write_fd(), libc::F_GETFL);
            libc::fcntl(pipe.write_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        Ok(Arc::new(Self {
            pipe,
            running: AtomicBool::new(false),
            page: AtomicU32::new(0),
        }))
    }

    fn produce(&self) {
        if !self.is_running() {
            return;
        }
        let seq = self.page.fetch_add(1, Ordering::Relaxed);
        let mut page = Vec::with_capacity(64);
        page.extend_from_slice(b"OggS\x00\x00");
        page.extend_from_slice(&seq.to_le_bytes());
        page.resize(64, 0x55);
        let _ = self.pipe.write(&page);
    }
}

impl Receiver for ToneReceiver {
    fn is_ready(&self) -> bool {
        true
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.pipe.read_fd())
    }
}

/// State shared between the event loop and the pipeline worker
struct Shared {
    receivers: Vec<Arc<ToneReceiver>>,
    locked: Mutex<bool>,
    unlocked: Condvar,
    stop: AtomicBool,
}

impl Shared {
    fn lock(&self) {
        let mut locked = self.locked.lock().unwrap_or_else(|e| e.into_inner());
        while *locked {
            locked = self.unlocked.wait(locked).unwrap_or_else(|e| e.into_inner());
        }
        *locked = true;
    }

    fn unlock(&self) {
        *self.locked.lock().unwrap_or_else(|e| e.into_inner()) = false;
        self.unlocked.notify_one();
    }

    fn tick(&self) {
        self.lock();
        for receiver in &self.receivers {
            receiver.produce();
        }
        self.unlock();
    }
}

/// Pipeline with one worker thread ticking every receiver
struct WorkerPipeline {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPipeline {
    fn new(receivers: Vec<Arc<ToneReceiver>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                receivers,
                locked: Mutex::new(false),
                unlocked: Condvar::new(),
                stop: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }
}

impl Pipeline for WorkerPipeline {
    fn lock(&self) {
        self.shared.lock();
    }

    fn unlock(&self) {
        self.shared.unlock();
    }

    fn start(&self) {
        self.shared.stop.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || {
            tracing::debug!("Pipeline worker running");
            while !shared.stop.load(Ordering::SeqCst) {
                shared.tick();
                thread::sleep(Duration::from_millis(50));
            }
            tracing::debug!("Pipeline worker exiting");
        });
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    fn wait(&self) {
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// One accepted client
struct Conn {
    stream: TcpStream,
    session: Session,
    request: Vec<u8>,
    deadline: Option<Instant>,
}

/// Transport writing straight to the client socket
struct SocketTransport<'a> {
    stream: &'a mut TcpStream,
    deadline: &'a mut Option<Instant>,
}

impl Transport for SocketTransport<'_> {
    fn respond_status(&mut self, status: u16) {
        let head = ResponseHead::new(status).header("Content-Length", "0");
        let _ = self.stream.write_all(&head.encode());
    }

    fn write_head(&mut self, head: &ResponseHead) -> io::Result<()> {
        self.stream.write_all(&head.encode())
    }

    fn write_body(&mut self, data: Bytes) -> io::Result<usize> {
        // A full socket buffer takes part of the chunk; the rest stays queued
        match self.stream.write(&data) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        *self.deadline = Some(Instant::now() + timeout);
    }

    fn transaction_completed(&mut self) -> bool {
        true
    }
}

struct Server {
    listener: TcpListener,
    mux: Multiplexer,
    conns: HashMap<RawFd, Conn>,
}

impl Server {
    fn run(&mut self) -> io::Result<()> {
        let listen_fd = self.listener.as_raw_fd();
        let mut transport = NullTransport;
        self.mux.dispatch(
            None,
            &mut transport,
            HttpEvent::AddPollFd {
                fd: listen_fd,
                events: libc::POLLIN,
            },
        );

        loop {
            self.mux.wait(Some(Duration::from_millis(500)))?;
            let ready: Vec<Readiness> = self.mux.poll_ready().collect();

            for readiness in ready {
                match readiness {
                    Readiness::Transport { fd, .. } if fd == listen_fd => self.accept(),
                    Readiness::Transport { fd, .. } => self.read_request(fd),
                    Readiness::Audio(session) => self.writable(session),
                }
            }
            self.expire();

            let stats = self.mux.stats();
            tracing::trace!(
                active = stats.active_streams,
                fds = stats.open_fds,
                bytes = stats.bytes_forwarded,
                "Tick"
            );
        }
    }

    fn accept(&mut self) {
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept connection");
                return;
            }
        };
        if let Err(e) = stream.set_nonblocking(true) {
            tracing::error!(error = %e, "Failed to configure socket");
            return;
        }

        let fd = stream.as_raw_fd();
        let mut transport = NullTransport;
        let event = HttpEvent::AddPollFd {
            fd,
            events: libc::POLLIN,
        };
        if self.mux.dispatch(None, &mut transport, event) == Disposition::Close {
            tracing::warn!(peer = %peer, "Connection refused: poll set full");
            return;
        }

        let session = self.mux.new_session();
        tracing::debug!(session_id = session.id, peer = %peer, "New connection");
        self.conns.insert(
            fd,
            Conn {
                stream,
                session,
                request: Vec::new(),
                deadline: None,
            },
        );
    }

    fn read_request(&mut self, fd: RawFd) {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return;
        };

        let mut buf = [0u8; 1024];
        let path = match conn.stream.read(&mut buf) {
            Ok(0) => None,
            Ok(n) => {
                conn.request.extend_from_slice(&buf[..n]);
                if !conn.request.windows(4).any(|w| w == b"\r\n\r\n") {
                    return;
                }
                let head = String::from_utf8_lossy(&conn.request).into_owned();
                conn.request.clear();
                Some(head.split_whitespace().nth(1).unwrap_or("").to_owned())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(_) => None,
        };

        let disposition = match path {
            Some(path) => self.event(fd, HttpEvent::NewRequest { path }),
            None => Disposition::Close,
        };
        if disposition == Disposition::Close {
            self.hang_up(fd);
        }
    }

    fn writable(&mut self, session: SessionId) {
        let fd = self
            .conns
            .iter()
            .find(|(_, conn)| conn.session.id == session)
            .map(|(fd, _)| *fd);
        if let Some(fd) = fd {
            if self.event(fd, HttpEvent::Writable) == Disposition::Close {
                self.hang_up(fd);
            }
        }
    }

    fn expire(&mut self) {
        let now = Instant::now();
        let expired: Vec<RawFd> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.deadline.is_some_and(|d| d < now))
            .map(|(fd, _)| *fd)
            .collect();
        for fd in expired {
            tracing::debug!(fd = fd, "Connection timed out");
            self.hang_up(fd);
        }
    }

    fn event(&mut self, fd: RawFd, event: HttpEvent) -> Disposition {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return Disposition::Continue;
        };
        let mut transport = SocketTransport {
            stream: &mut conn.stream,
            deadline: &mut conn.deadline,
        };
        self.mux
            .dispatch(Some(&mut conn.session), &mut transport, event)
    }

    fn hang_up(&mut self, fd: RawFd) {
        self.event(fd, HttpEvent::Closed);
        let mut transport = NullTransport;
        self.mux
            .dispatch(None, &mut transport, HttpEvent::DelPollFd { fd });
        self.conns.remove(&fd);
    }
}

/// Transport for engine-level events that have no connection
struct NullTransport;

impl Transport for NullTransport {
    fn respond_status(&mut self, _status: u16) {}

    fn write_head(&mut self, _head: &ResponseHead) -> io::Result<()> {
        Ok(())
    }

    fn write_body(&mut self, data: Bytes) -> io::Result<usize> {
        Ok(data.len())
    }

    fn set_timeout(&mut self, _timeout: Duration) {}

    fn transaction_completed(&mut self) -> bool {
        true
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ogg_mux=debug,loopback=debug")),
        )
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8073".to_string())
        .parse()?;

    let mut builder = StreamRegistry::builder();
    let mut receivers = Vec::new();
    for id in ["abcdefgh", "radio-01"] {
        let receiver = ToneReceiver::new()?;
        let name = StreamName::new(id).ok_or("invalid stream id")?;
        tracing::info!(url = %name.path(), "Serving stream");
        builder = builder.insert(name, receiver.clone());
        receivers.push(receiver);
    }
    let registry = Arc::new(builder.build());
    let pipeline: Arc<dyn Pipeline> = Arc::new(WorkerPipeline::new(receivers));

    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    tracing::info!(addr = %addr, "Stream server listening");

    let mut server = Server {
        listener,
        mux: Multiplexer::new(MuxConfig::default(), registry, pipeline),
        conns: HashMap::new(),
    };
    server.run()?;
    Ok(())
}
