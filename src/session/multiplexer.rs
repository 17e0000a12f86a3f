//! Stream session multiplexer
//!
//! Owns the poll table, the descriptor router and the pipeline coordinator,
//! and drives every session through its lifecycle. All of it lives on the
//! event loop thread; callbacks from the HTTP engine arrive through
//! [`Multiplexer::dispatch`].
//!
//! # Request flow
//!
//! ```text
//!   NewRequest ─► length check ─► validate name ─► registry.resolve
//!                                                        │
//!          404 ◄── not found / not ready / busy / full ◄─┤
//!                                                        ▼
//!                  poll.add + router.bind ─► coordinator.attach ─► 200 head
//!
//!   poll() ─► Readiness::Audio(session) ─► Writable ─► read fd ─► write_body
//!
//!   Closed ─► poll.remove + router.unbind ─► coordinator.detach
//! ```

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::backend::{read_nonblocking, Pipeline};
use crate::config::MuxConfig;
use crate::error::{Error, Result};
use crate::poll::{FdRouter, PollEvents, PollTable};
use crate::stats::MuxStats;
use crate::stream::{validate, StreamRegistry};

use super::coordinator::PipelineCoordinator;
use super::event::{Disposition, HttpEvent, Readiness};
use super::state::{Session, SessionId, SessionPhase};
use super::transport::{ResponseHead, Transport, STATUS_NOT_FOUND};

/// Multiplexes stream sessions onto one poll set
pub struct Multiplexer {
    config: MuxConfig,
    registry: Arc<StreamRegistry>,
    coordinator: PipelineCoordinator,
    poll: PollTable,
    router: FdRouter,
    read_buf: BytesMut,
    stats: MuxStats,
    next_session_id: SessionId,
}

impl Multiplexer {
    /// Create a multiplexer serving the streams in `registry`
    pub fn new(
        config: MuxConfig,
        registry: Arc<StreamRegistry>,
        pipeline: Arc<dyn Pipeline>,
    ) -> Self {
        Self {
            poll: PollTable::with_fd_limit(config.max_fds, config.fd_limit),
            router: FdRouter::with_fd_limit(config.fd_limit),
            read_buf: BytesMut::with_capacity(config.read_buffer_size),
            config,
            registry,
            coordinator: PipelineCoordinator::new(pipeline),
            stats: MuxStats::new(),
            next_session_id: 1,
        }
    }

    /// Create the state for a newly accepted connection
    pub fn new_session(&mut self) -> Session {
        let id = self.next_session_id;
        self.next_session_id += 1;
        Session::new(id)
    }

    /// Handle a callback from the HTTP engine
    ///
    /// Connection-scoped events without a session are ignored.
    pub fn dispatch<T: Transport + ?Sized>(
        &mut self,
        session: Option<&mut Session>,
        transport: &mut T,
        event: HttpEvent,
    ) -> Disposition {
        match event {
            HttpEvent::AddPollFd { fd, events } => match self.add_poll_fd(fd, events) {
                Ok(()) => Disposition::Continue,
                Err(_) => Disposition::Close,
            },
            HttpEvent::DelPollFd { fd } => {
                self.del_poll_fd(fd);
                Disposition::Continue
            }
            HttpEvent::ChangeModePollFd { fd, events } => {
                self.change_poll_fd(fd, events);
                Disposition::Continue
            }
            event => {
                let Some(session) = session else {
                    tracing::debug!(event = ?event, "Session event without session state");
                    return Disposition::Continue;
                };
                self.dispatch_session(session, transport, event)
            }
        }
    }

    fn dispatch_session<T: Transport + ?Sized>(
        &mut self,
        session: &mut Session,
        transport: &mut T,
        event: HttpEvent,
    ) -> Disposition {
        match event {
            HttpEvent::NewRequest { path } => match self.open(session, transport, &path) {
                Ok(()) => Disposition::Continue,
                Err(_) => Disposition::Close,
            },
            HttpEvent::Closed => {
                self.close(session);
                Disposition::Continue
            }
            HttpEvent::Writable if session.is_streaming() => {
                match self.forward(session, transport) {
                    Ok(_) => Disposition::Continue,
                    Err(_) => Disposition::Close,
                }
            }
            HttpEvent::Writable | HttpEvent::FileCompletion => {
                if transport.transaction_completed() {
                    Disposition::Close
                } else {
                    Disposition::Continue
                }
            }
            // Poll events are handled in dispatch
            HttpEvent::AddPollFd { .. }
            | HttpEvent::DelPollFd { .. }
            | HttpEvent::ChangeModePollFd { .. } => Disposition::Continue,
        }
    }

    /// Start serving `path` on `session`
    ///
    /// On error the client has already been answered with 404 and the
    /// connection should be closed.
    pub fn open<T: Transport + ?Sized>(
        &mut self,
        session: &mut Session,
        transport: &mut T,
        path: &str,
    ) -> Result<()> {
        self.stats.requests += 1;
        tracing::debug!(session_id = session.id, url = %path, "Stream requested");

        if session.is_streaming() {
            // Same connection asking again: drop the stream it holds first
            self.close(session);
        }

        let started = if path.len() > self.config.max_url_len {
            session.begin("");
            Err(Error::UrlTooLong {
                len: path.len(),
                max: self.config.max_url_len,
            })
        } else {
            session.begin(path);
            self.start_stream(session)
        };

        if let Err(e) = started {
            tracing::warn!(
                session_id = session.id,
                url = %path,
                error = %e,
                "Stream request rejected"
            );
            transport.respond_status(STATUS_NOT_FOUND);
            self.stats.rejected += 1;
            session.reject(e.clone());
            return Err(e);
        }

        if let Err(e) = transport.write_head(&ResponseHead::audio_ogg()) {
            tracing::debug!(session_id = session.id, error = %e, "Failed to write response head");
            // Never served, so neither counter moves
            self.release(session);
            return Err(Error::Io(e));
        }

        self.stats.streams_started += 1;
        if let Some(stream) = session.stream() {
            tracing::info!(
                session_id = session.id,
                stream = %stream,
                fd = ?session.fd(),
                "Stream started"
            );
        }
        Ok(())
    }

    fn start_stream(&mut self, session: &mut Session) -> Result<()> {
        let name = validate(session.url()).ok_or(Error::InvalidPath)?;
        session.resolving(name.clone());

        let receiver = self.registry.resolve(&name)?;
        if !receiver.is_ready() {
            return Err(Error::StreamNotReady(name));
        }
        if receiver.is_running() {
            return Err(Error::StreamBusy(name));
        }
        let fd = receiver.fd().ok_or_else(|| Error::MissingFd(name.clone()))?;

        self.poll.add(fd, libc::POLLIN)?;
        match self.router.bind(fd, session.id) {
            Ok(None) => {}
            Ok(Some(previous)) => {
                tracing::error!(
                    fd = fd,
                    previous = previous,
                    session_id = session.id,
                    "Audio fd was still routed"
                );
                self.stats.faults += 1;
            }
            Err(e) => {
                let _ = self.poll.remove(fd);
                return Err(e);
            }
        }

        self.coordinator.attach(receiver.as_ref());
        session.streaming(receiver, fd);
        Ok(())
    }

    /// Tear down `session`, releasing its descriptor and receiver
    ///
    /// Safe to call from any phase and more than once.
    pub fn close(&mut self, session: &mut Session) {
        match session.phase() {
            SessionPhase::Closed => return,
            SessionPhase::Streaming => {
                self.release(session);
                self.stats.streams_closed += 1;
            }
            _ => {}
        }
        session.phase = SessionPhase::Closed;
    }

    fn release(&mut self, session: &mut Session) {
        if let Some(stream) = session.stream() {
            tracing::info!(
                session_id = session.id,
                stream = %stream,
                bytes = session.bytes_forwarded(),
                "Closing stream"
            );
        }

        if let Some(fd) = session.fd.take() {
            if let Err(e) = self.poll.remove(fd) {
                tracing::error!(
                    session_id = session.id,
                    fd = fd,
                    error = %e,
                    "Audio fd missing from poll table"
                );
                self.stats.faults += 1;
            }
            match self.router.unbind(fd) {
                Some(owner) if owner == session.id => {}
                owner => {
                    tracing::error!(
                        session_id = session.id,
                        fd = fd,
                        owner = ?owner,
                        "Audio fd routed to another session"
                    );
                    self.stats.faults += 1;
                }
            }
        }

        if let Some(receiver) = session.receiver.take() {
            if self.coordinator.detach(receiver.as_ref()).is_err() {
                self.stats.faults += 1;
            }
        }

        session.pending.clear();
        session.phase = SessionPhase::Closed;
    }

    /// Forward whatever audio is available on the session's descriptor
    ///
    /// Bytes the transport did not accept last time are offered first, and
    /// nothing new is read until they are gone. Returns the number of bytes
    /// the transport accepted; zero when nothing was ready. Any read or write
    /// failure closes the session.
    pub fn forward<T: Transport + ?Sized>(
        &mut self,
        session: &mut Session,
        transport: &mut T,
    ) -> Result<usize> {
        let fd = match session.fd() {
            Some(fd) if session.is_streaming() => fd,
            _ => return Ok(0),
        };

        let mut sent = 0;
        if !session.pending.is_empty() {
            let pending = std::mem::take(&mut session.pending);
            sent = self.offer(session, transport, pending)?;
            if !session.pending.is_empty() {
                return Ok(sent);
            }
        }

        self.read_buf.clear();
        self.read_buf.resize(self.config.read_buffer_size, 0);

        let n = match read_nonblocking(fd, &mut self.read_buf) {
            Ok(0) => {
                tracing::debug!(session_id = session.id, fd = fd, "Audio fd closed by receiver");
                self.close(session);
                return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            Ok(n) => n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return Ok(sent);
            }
            Err(e) => {
                tracing::warn!(session_id = session.id, fd = fd, error = %e, "Audio read failed");
                self.close(session);
                return Err(Error::Io(e));
            }
        };

        let chunk = self.read_buf.split_to(n).freeze();
        sent += self.offer(session, transport, chunk)?;
        Ok(sent)
    }

    /// Hand `chunk` to the transport, keeping on the session what it refuses
    fn offer<T: Transport + ?Sized>(
        &mut self,
        session: &mut Session,
        transport: &mut T,
        chunk: Bytes,
    ) -> Result<usize> {
        let len = chunk.len();
        let accepted = match transport.write_body(chunk.clone()) {
            Ok(accepted) => accepted.min(len),
            Err(e) => {
                tracing::debug!(session_id = session.id, error = %e, "Transport write failed");
                self.close(session);
                return Err(Error::Io(e));
            }
        };

        if accepted < len {
            tracing::trace!(
                session_id = session.id,
                accepted = accepted,
                pending = len - accepted,
                "Short transport write"
            );
            session.pending = chunk.slice(accepted..);
        }
        if accepted > 0 {
            transport.set_timeout(self.config.inactivity_timeout);
            session.bytes_forwarded += accepted as u64;
            self.stats.bytes_forwarded += accepted as u64;
        }
        Ok(accepted)
    }

    /// Watch a descriptor on behalf of the HTTP engine
    pub fn add_poll_fd(&mut self, fd: RawFd, events: PollEvents) -> Result<()> {
        tracing::trace!(fd = fd, events = events, "Add poll fd");
        self.poll.add(fd, events)
    }

    /// Stop watching a descriptor on behalf of the HTTP engine
    pub fn del_poll_fd(&mut self, fd: RawFd) {
        tracing::trace!(fd = fd, "Delete poll fd");
        if let Err(e) = self.poll.remove(fd) {
            tracing::error!(fd = fd, error = %e, "Delete of unwatched fd");
            self.stats.faults += 1;
        }
    }

    /// Change a descriptor's watch mask on behalf of the HTTP engine
    pub fn change_poll_fd(&mut self, fd: RawFd, events: PollEvents) {
        if let Err(e) = self.poll.set_events(fd, events) {
            tracing::error!(fd = fd, error = %e, "Mode change of unwatched fd");
            self.stats.faults += 1;
        }
    }

    /// Wait for readiness on the poll set
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.poll.wait(timeout)
    }

    /// Descriptors reported ready by the last [`wait`](Self::wait)
    pub fn poll_ready(&self) -> impl Iterator<Item = Readiness> + '_ {
        self.poll.ready().map(|(fd, revents)| match self.router.route(fd) {
            Some(session) => Readiness::Audio(session),
            None => Readiness::Transport { fd, revents },
        })
    }

    /// Current statistics
    pub fn stats(&self) -> MuxStats {
        MuxStats {
            active_streams: self.coordinator.active_streams(),
            open_fds: self.poll.len(),
            ..self.stats.clone()
        }
    }

    /// The poll table
    pub fn poll_table(&self) -> &PollTable {
        &self.poll
    }

    /// The descriptor router
    pub fn router(&self) -> &FdRouter {
        &self.router
    }

    /// The pipeline coordinator
    pub fn coordinator(&self) -> &PipelineCoordinator {
        &self.coordinator
    }

    /// The stream registry
    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// The configuration
    pub fn config(&self) -> &MuxConfig {
        &self.config
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("poll", &self.poll)
            .field("router", &self.router)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AudioPipe, Receiver};
    use crate::stream::StreamName;
    use crate::test_support::{
        init_tracing, CallLog, MockPipeline, MockReceiver, MockTransport,
    };

    struct Fixture {
        log: CallLog,
        pipeline: Arc<MockPipeline>,
        a: Arc<MockReceiver>,
        b: Arc<MockReceiver>,
        mux: Multiplexer,
    }

    fn fixture(config: MuxConfig) -> Fixture {
        init_tracing();
        let log = CallLog::default();
        let pipeline = MockPipeline::new(&log);
        let a = MockReceiver::new("a", &log);
        let b = MockReceiver::new("b", &log);
        let registry = StreamRegistry::builder()
            .insert(StreamName::new("abcdefgh").unwrap(), a.clone())
            .insert(StreamName::new("bbbbbbbb").unwrap(), b.clone())
            .insert(
                StreamName::new("notready").unwrap(),
                MockReceiver::not_ready("n", &log),
            )
            .insert(
                StreamName::new("nodescri").unwrap(),
                MockReceiver::without_fd("d", &log),
            )
            .insert(
                StreamName::new("hungup01").unwrap(),
                MockReceiver::hung_up("h", &log),
            )
            .build();
        let mux = Multiplexer::new(config, Arc::new(registry), pipeline.clone());

        Fixture {
            log,
            pipeline,
            a,
            b,
            mux,
        }
    }

    fn request(
        mux: &mut Multiplexer,
        transport: &mut MockTransport,
        path: &str,
    ) -> (Session, Disposition) {
        let mut session = mux.new_session();
        let disposition = mux.dispatch(
            Some(&mut session),
            transport,
            HttpEvent::NewRequest { path: path.into() },
        );
        (session, disposition)
    }

    #[test]
    fn test_open_stream() {
        let mut f = fixture(MuxConfig::default());
        let mut transport = MockTransport::default();

        let (session, disposition) = request(&mut f.mux, &mut transport, "/streams/abcdefgh.ogg");

        assert_eq!(disposition, Disposition::Continue);
        assert_eq!(session.phase(), SessionPhase::Streaming);
        assert_eq!(transport.heads, vec![ResponseHead::audio_ogg()]);
        assert!(transport.statuses.is_empty());

        let fd = f.a.pipe().read_fd();
        assert_eq!(session.fd(), Some(fd));
        assert!(f.mux.poll_table().contains(fd));
        assert_eq!(f.mux.router().route(fd), Some(session.id));

        assert_eq!(f.mux.coordinator().active_streams(), 1);
        assert_eq!(f.pipeline.starts(), 1);
        assert!(f.a.is_running());
        assert_eq!(
            f.log.take(),
            vec!["lock", "a.start", "unlock", "pipeline.start"]
        );
    }

    #[test]
    fn test_second_request_rejected_while_streaming() {
        let mut f = fixture(MuxConfig::default());
        let mut first = MockTransport::default();
        let (_session, _) = request(&mut f.mux, &mut first, "/streams/abcdefgh.ogg");
        f.log.take();

        let mut second = MockTransport::default();
        let (session, disposition) = request(&mut f.mux, &mut second, "/streams/abcdefgh.ogg");

        assert_eq!(disposition, Disposition::Close);
        assert_eq!(second.statuses, vec![STATUS_NOT_FOUND]);
        assert!(second.heads.is_empty());
        assert!(matches!(session.rejection(), Some(Error::StreamBusy(_))));

        assert_eq!(f.mux.poll_table().len(), 1);
        assert_eq!(f.mux.coordinator().active_streams(), 1);
        assert!(f.log.take().is_empty());
    }

    #[test]
    fn test_malformed_path_skips_registry() {
        let mut f = fixture(MuxConfig::default());
        let mut transport = MockTransport::default();

        let (session, disposition) =
            request(&mut f.mux, &mut transport, "/streams/toolong123456.ogg");

        assert_eq!(disposition, Disposition::Close);
        assert_eq!(transport.statuses, vec![STATUS_NOT_FOUND]);
        assert_eq!(session.phase(), SessionPhase::Rejected);
        assert!(matches!(session.rejection(), Some(Error::InvalidPath)));
        // Never reached resolving
        assert!(session.stream().is_none());
        assert!(f.mux.poll_table().is_empty());
    }

    #[test]
    fn test_oversized_url() {
        let mut f = fixture(MuxConfig::default().max_url_len(16));
        let mut transport = MockTransport::default();

        let (session, _) = request(&mut f.mux, &mut transport, "/streams/abcdefgh.ogg");

        assert_eq!(transport.statuses, vec![STATUS_NOT_FOUND]);
        assert!(matches!(
            session.rejection(),
            Some(Error::UrlTooLong { len: 21, max: 16 })
        ));
        assert_eq!(session.url(), "");
        assert!(!f.a.is_running());
    }

    #[test]
    fn test_resolution_failures() {
        let mut f = fixture(MuxConfig::default());

        let cases = [
            ("/streams/zzzzzzzz.ogg", "not found"),
            ("/streams/notready.ogg", "not ready"),
            ("/streams/nodescri.ogg", "no descriptor"),
        ];
        for (path, case) in cases {
            let mut transport = MockTransport::default();
            let (session, disposition) = request(&mut f.mux, &mut transport, path);

            assert_eq!(disposition, Disposition::Close, "{}", case);
            assert_eq!(transport.statuses, vec![STATUS_NOT_FOUND], "{}", case);
            assert_eq!(session.phase(), SessionPhase::Rejected, "{}", case);
            assert!(session.rejection().unwrap().is_client_error(), "{}", case);
        }

        assert!(f.mux.poll_table().is_empty());
        assert_eq!(f.mux.coordinator().active_streams(), 0);
        assert_eq!(f.pipeline.starts(), 0);

        let stats = f.mux.stats();
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.rejected, 3);
        assert_eq!(stats.streams_started, 0);
    }

    fn add_fd(mux: &mut Multiplexer, transport: &mut MockTransport, fd: RawFd) -> Disposition {
        let event = HttpEvent::AddPollFd {
            fd,
            events: libc::POLLIN,
        };
        mux.dispatch(None, transport, event)
    }

    #[test]
    fn test_capacity_exhausted() {
        let mut f = fixture(MuxConfig::default().max_fds(2));
        let mut transport = MockTransport::default();

        assert_eq!(add_fd(&mut f.mux, &mut transport, 100), Disposition::Continue);
        assert_eq!(add_fd(&mut f.mux, &mut transport, 101), Disposition::Continue);

        let (session, disposition) = request(&mut f.mux, &mut transport, "/streams/abcdefgh.ogg");

        assert_eq!(disposition, Disposition::Close);
        assert!(matches!(
            session.rejection(),
            Some(Error::PollTableFull { max_fds: 2 })
        ));
        let fd = f.a.pipe().read_fd();
        assert!(!f.mux.poll_table().contains(fd));
        assert_eq!(f.mux.router().route(fd), None);
        assert!(f.mux.router().is_empty());
        assert_eq!(f.mux.poll_table().len(), 2);
        assert_eq!(f.mux.coordinator().active_streams(), 0);
        assert!(!f.a.is_running());
        assert_eq!(f.pipeline.starts(), 0);

        // A further engine socket is refused too
        assert_eq!(add_fd(&mut f.mux, &mut transport, 102), Disposition::Close);
    }

    #[test]
    fn test_fd_above_limit_refused() {
        let mut f = fixture(MuxConfig::default().fd_limit(512));
        let mut transport = MockTransport::default();

        assert_eq!(add_fd(&mut f.mux, &mut transport, 511), Disposition::Continue);
        assert_eq!(add_fd(&mut f.mux, &mut transport, 512), Disposition::Close);
        assert_eq!(add_fd(&mut f.mux, &mut transport, RawFd::MAX), Disposition::Close);

        assert_eq!(f.mux.poll_table().len(), 1);
        assert!(f.mux.poll_table().contains(511));
    }

    #[test]
    fn test_close_releases_everything() {
        let mut f = fixture(MuxConfig::default());
        let mut transport = MockTransport::default();
        let (mut session, _) = request(&mut f.mux, &mut transport, "/streams/abcdefgh.ogg");
        f.log.take();

        f.mux.dispatch(Some(&mut session), &mut transport, HttpEvent::Closed);

        assert!(session.is_closed());
        assert!(session.fd().is_none());
        assert!(f.mux.poll_table().is_empty());
        assert!(f.mux.router().is_empty());
        assert_eq!(f.mux.coordinator().active_streams(), 0);
        assert!(!f.a.is_running());
        assert_eq!(
            f.log.take(),
            vec!["pipeline.stop", "pipeline.wait", "lock", "a.stop", "unlock"]
        );
    }

    #[test]
    fn test_close_twice_is_noop() {
        let mut f = fixture(MuxConfig::default());
        let mut transport = MockTransport::default();
        let (mut first, _) = request(&mut f.mux, &mut transport, "/streams/abcdefgh.ogg");
        let (_second, _) = request(&mut f.mux, &mut transport, "/streams/bbbbbbbb.ogg");

        f.mux.close(&mut first);
        f.mux.close(&mut first);

        assert_eq!(f.mux.coordinator().active_streams(), 1);
        assert_eq!(f.pipeline.stops(), 0);
        assert!(f.b.is_running());

        let stats = f.mux.stats();
        assert_eq!(stats.streams_closed, 1);
        assert_eq!(stats.faults, 0);
    }

    #[test]
    fn test_close_rejected_session_leaves_stream() {
        let mut f = fixture(MuxConfig::default());
        let mut transport = MockTransport::default();
        let (_owner, _) = request(&mut f.mux, &mut transport, "/streams/abcdefgh.ogg");
        let (mut duplicate, _) = request(&mut f.mux, &mut transport, "/streams/abcdefgh.ogg");
        f.log.take();

        f.mux.dispatch(Some(&mut duplicate), &mut transport, HttpEvent::Closed);

        assert!(duplicate.is_closed());
        assert!(f.a.is_running());
        assert_eq!(f.mux.coordinator().active_streams(), 1);
        assert_eq!(f.mux.poll_table().len(), 1);
        assert!(f.log.take().is_empty());
    }

    #[test]
    fn test_pipeline_follows_active_count() {
        let mut f = fixture(MuxConfig::default());
        let mut transport = MockTransport::default();

        let (mut a, _) = request(&mut f.mux, &mut transport, "/streams/abcdefgh.ogg");
        let (mut b, _) = request(&mut f.mux, &mut transport, "/streams/bbbbbbbb.ogg");
        assert_eq!(f.pipeline.starts(), 1);
        assert_eq!(f.mux.coordinator().active_streams(), 2);
        assert_eq!(f.mux.registry().running_count(), 2);

        f.mux.close(&mut a);
        assert_eq!(f.pipeline.stops(), 0);

        f.mux.close(&mut b);
        assert_eq!(f.pipeline.stops(), 1);
        assert_eq!(f.mux.registry().running_count(), 0);
    }

    #[test]
    fn test_forward_audio() {
        let mut f = fixture(MuxConfig::default());
        let mut transport = MockTransport::default();
        let (mut session, _) = request(&mut f.mux, &mut transport, "/streams/abcdefgh.ogg");

        f.a.pipe().write(b"OggS page one").unwrap();
        let disposition = f.mux.dispatch(Some(&mut session), &mut transport, HttpEvent::Writable);

        assert_eq!(disposition, Disposition::Continue);
        assert_eq!(transport.body, b"OggS page one");
        assert_eq!(transport.timeouts, vec![Duration::from_secs(5)]);
        assert_eq!(session.bytes_forwarded(), 13);
        assert_eq!(f.mux.stats().bytes_forwarded, 13);
    }

    #[test]
    fn test_forward_in_chunks() {
        let mut f = fixture(MuxConfig::default().read_buffer_size(4));
        let mut transport = MockTransport::default();
        let (mut session, _) = request(&mut f.mux, &mut transport, "/streams/abcdefgh.ogg");

        f.a.pipe().write(b"0123456789").unwrap();
        assert_eq!(f.mux.forward(&mut session, &mut transport).unwrap(), 4);
        assert_eq!(f.mux.forward(&mut session, &mut transport).unwrap(), 4);
        assert_eq!(f.mux.forward(&mut session, &mut transport).unwrap(), 2);
        assert_eq!(f.mux.forward(&mut session, &mut transport).unwrap(), 0);

        assert_eq!(transport.body, b"0123456789");
        assert_eq!(transport.timeouts.len(), 3);
    }

    #[test]
    fn test_forward_short_writes_keep_tail() {
        let mut f = fixture(MuxConfig::default());
        let mut transport = MockTransport {
            max_write: Some(3),
            ..Default::default()
        };
        let (mut session, _) = request(&mut f.mux, &mut transport, "/streams/abcdefgh.ogg");

        f.a.pipe().write(b"OggS-page-0123").unwrap();
        assert_eq!(f.mux.forward(&mut session, &mut transport).unwrap(), 3);
        assert_eq!(transport.body, b"Ogg");
        assert_eq!(session.bytes_forwarded(), 3);
        assert_eq!(session.pending_len(), 11);

        // Newer audio queues behind the held tail
        f.a.pipe().write(b"NEXT").unwrap();
        let mut sent = Vec::new();
        while transport.body.len() < 18 {
            sent.push(f.mux.forward(&mut session, &mut transport).unwrap());
        }

        assert_eq!(sent, vec![3, 3, 3, 5, 1]);
        assert_eq!(transport.body, b"OggS-page-0123NEXT");
        assert_eq!(session.pending_len(), 0);
        assert_eq!(session.bytes_forwarded(), 18);
        assert_eq!(f.mux.stats().bytes_forwarded, 18);
        assert_eq!(f.mux.forward(&mut session, &mut transport).unwrap(), 0);
    }

    #[test]
    fn test_forward_eof_closes() {
        let mut f = fixture(MuxConfig::default());
        let mut transport = MockTransport::default();
        let (mut session, _) = request(&mut f.mux, &mut transport, "/streams/hungup01.ogg");
        assert!(session.is_streaming());
        f.log.take();

        let disposition = f.mux.dispatch(Some(&mut session), &mut transport, HttpEvent::Writable);

        assert_eq!(disposition, Disposition::Close);
        assert!(session.is_closed());
        assert!(transport.body.is_empty());
        assert!(f.mux.poll_table().is_empty());
        assert!(f.mux.router().is_empty());
        assert_eq!(f.mux.coordinator().active_streams(), 0);
        assert_eq!(
            f.log.take(),
            vec!["pipeline.stop", "pipeline.wait", "lock", "h.stop", "unlock"]
        );
        assert_eq!(f.pipeline.stops(), 1);

        let stats = f.mux.stats();
        assert_eq!(stats.streams_closed, 1);
        assert_eq!(stats.faults, 0);
    }

    #[test]
    fn test_forward_would_block() {
        let mut f = fixture(MuxConfig::default());
        let mut transport = MockTransport::default();
        let (mut session, _) = request(&mut f.mux, &mut transport, "/streams/abcdefgh.ogg");

        let disposition = f.mux.dispatch(Some(&mut session), &mut transport, HttpEvent::Writable);

        assert_eq!(disposition, Disposition::Continue);
        assert!(session.is_streaming());
        assert!(transport.body.is_empty());
        assert!(transport.timeouts.is_empty());
    }

    #[test]
    fn test_forward_write_failure_closes() {
        let mut f = fixture(MuxConfig::default());
        let mut transport = MockTransport::default();
        let (mut session, _) = request(&mut f.mux, &mut transport, "/streams/abcdefgh.ogg");

        f.a.pipe().write(b"OggS").unwrap();
        transport.fail_writes = true;
        let disposition = f.mux.dispatch(Some(&mut session), &mut transport, HttpEvent::Writable);

        assert_eq!(disposition, Disposition::Close);
        assert!(session.is_closed());
        assert_eq!(f.mux.coordinator().active_streams(), 0);

        // The engine's close callback afterwards changes nothing
        f.mux.dispatch(Some(&mut session), &mut transport, HttpEvent::Closed);
        assert_eq!(f.pipeline.stops(), 1);
        assert_eq!(f.mux.stats().faults, 0);
    }

    #[test]
    fn test_head_write_failure_releases_stream() {
        let mut f = fixture(MuxConfig::default());
        let mut transport = MockTransport {
            fail_writes: true,
            ..Default::default()
        };

        let (session, disposition) = request(&mut f.mux, &mut transport, "/streams/abcdefgh.ogg");

        assert_eq!(disposition, Disposition::Close);
        assert!(session.is_closed());
        assert!(!f.a.is_running());
        assert!(f.mux.poll_table().is_empty());
        assert_eq!(f.mux.coordinator().active_streams(), 0);

        let stats = f.mux.stats();
        assert_eq!(stats.streams_started, 0);
        assert_eq!(stats.streams_closed, 0);
        assert_eq!(stats.rejected, 0);
    }

    #[test]
    fn test_writable_without_stream_reuses_connection() {
        let mut f = fixture(MuxConfig::default());
        let mut session = f.mux.new_session();
        let mut keep = MockTransport::default();
        let mut close = MockTransport {
            close_after_transaction: true,
            ..Default::default()
        };

        assert_eq!(
            f.mux.dispatch(Some(&mut session), &mut keep, HttpEvent::Writable),
            Disposition::Continue
        );
        assert_eq!(
            f.mux.dispatch(Some(&mut session), &mut close, HttpEvent::FileCompletion),
            Disposition::Close
        );
    }

    #[test]
    fn test_session_event_without_session() {
        let mut f = fixture(MuxConfig::default());
        let mut transport = MockTransport::default();

        let disposition = f.mux.dispatch(None, &mut transport, HttpEvent::Closed);

        assert_eq!(disposition, Disposition::Continue);
        assert_eq!(f.mux.stats().faults, 0);
    }

    #[test]
    fn test_poll_fd_events() {
        let mut f = fixture(MuxConfig::default());
        let mut transport = MockTransport::default();

        add_fd(&mut f.mux, &mut transport, 40);
        f.mux.dispatch(
            None,
            &mut transport,
            HttpEvent::ChangeModePollFd {
                fd: 40,
                events: libc::POLLIN | libc::POLLOUT,
            },
        );
        let slot = f.mux.poll_table().position(40).unwrap();
        assert_eq!(
            f.mux.poll_table().entries()[slot].events,
            libc::POLLIN | libc::POLLOUT
        );

        f.mux.dispatch(None, &mut transport, HttpEvent::DelPollFd { fd: 40 });
        assert!(!f.mux.poll_table().contains(40));

        // Unknown descriptors are faults but leave the table intact
        f.mux.dispatch(None, &mut transport, HttpEvent::DelPollFd { fd: 40 });
        f.mux.dispatch(
            None,
            &mut transport,
            HttpEvent::ChangeModePollFd {
                fd: 41,
                events: libc::POLLIN,
            },
        );
        assert_eq!(f.mux.stats().faults, 2);
        assert!(f.mux.poll_table().is_empty());
    }

    #[test]
    fn test_poll_ready_routes_audio() {
        let mut f = fixture(MuxConfig::default());
        let mut transport = MockTransport::default();
        let socket = AudioPipe::new().unwrap();
        add_fd(&mut f.mux, &mut transport, socket.read_fd());
        let (session, _) = request(&mut f.mux, &mut transport, "/streams/abcdefgh.ogg");

        socket.write(b"GET").unwrap();
        f.a.pipe().write(b"OggS").unwrap();
        let n = f.mux.wait(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(n, 2);

        let ready: Vec<Readiness> = f.mux.poll_ready().collect();
        assert!(ready.contains(&Readiness::Audio(session.id)));
        assert!(ready.iter().any(|r| matches!(
            r,
            Readiness::Transport { fd, .. } if *fd == socket.read_fd()
        )));
    }

    #[test]
    fn test_new_request_on_streaming_session() {
        let mut f = fixture(MuxConfig::default());
        let mut transport = MockTransport::default();
        let (mut session, _) = request(&mut f.mux, &mut transport, "/streams/abcdefgh.ogg");

        let disposition = f.mux.dispatch(
            Some(&mut session),
            &mut transport,
            HttpEvent::NewRequest {
                path: "/streams/bbbbbbbb.ogg".into(),
            },
        );

        assert_eq!(disposition, Disposition::Continue);
        assert!(!f.a.is_running());
        assert!(f.b.is_running());
        assert_eq!(session.fd(), Some(f.b.pipe().read_fd()));
        assert_eq!(f.mux.poll_table().len(), 1);
        assert_eq!(f.mux.coordinator().active_streams(), 1);
    }

    #[test]
    fn test_session_ids_increase() {
        let mut f = fixture(MuxConfig::default());

        let first = f.mux.new_session();
        let second = f.mux.new_session();
        assert!(second.id > first.id);
    }
}
