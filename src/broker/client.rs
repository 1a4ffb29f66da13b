//! Multi-client broker handle
//!
//! A [`MultiClient`] owns one connection to a broker socket. Launch and wait requests
//! may be issued from any thread; each is written under the writer lock and answered
//! by the single reader thread of the connection, which matches responses to pending
//! requests by message id.
//!
//! Completions and events are delivered on whichever thread notices the outcome
//! (reader, watchdog, attach thread, or the caller for immediate failures). Per
//! connection, `ConnectionClosed` is the last event and follows every completion
//! belonging to that connection.

use crate::broker::child::{Child, ChildState};
use crate::broker::config::{log_file_path, BrokerConfig, ClientConfig};
use crate::broker::protocol::{
    encode_message, write_message, AttachRequest, AttachResponse, ChildId, ChildReport,
    ExitStatus, FdReader, LaunchRequest, LaunchResponse, Message, MessageId, RequestError,
    WaitRequest, WaitResponse, UNSOLICITED,
};
use crate::completion::Completion;
use crate::error::{BrokerResult, ErrorKind, MultiClientError};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::net::Shutdown;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often a freshly launched broker is polled for its socket
const LAUNCH_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Upper bound on the request watchdog tick
const MAX_WATCHDOG_TICK: Duration = Duration::from_millis(100);

/// Connection lifecycle of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Attaching,
    Attached,
}

/// Notifications pushed to subscribers
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The broker reported a child that existed before this handle attached
    ChildDiscovered(Child),
    /// The broker reaped a child
    ChildTerminated(Child),
    /// The connection is gone; nothing else for it will be delivered
    ConnectionClosed,
}

/// Handle to one broker socket
///
/// Dropping the handle closes the connection. Children launched through it keep
/// running inside the broker.
pub struct MultiClient {
    shared: Arc<Shared>,
}

impl MultiClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ClientState {
                    connection: ConnectionState::Disconnected,
                    server_pid: None,
                    generation: 0,
                    launch_requested: false,
                    children: HashMap::new(),
                    pending: HashMap::new(),
                    attach_waiters: Vec::new(),
                    writer: None,
                    socket: None,
                    link: None,
                }),
                subscribers: Mutex::new(Vec::new()),
                next_message_id: AtomicU32::new(1),
            }),
        }
    }

    /// Handle for a socket path with default settings
    pub fn with_socket_path(path: impl Into<std::path::PathBuf>) -> Self {
        Self::new(ClientConfig::new(path))
    }

    /// Handle configured from `~/.ptybrokerrc` and the environment
    pub fn from_env() -> io::Result<Self> {
        Ok(Self::new(BrokerConfig::load().client_config()?))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Register for notifications
    ///
    /// Every subscriber receives every event. The receiver may live on any thread.
    pub fn subscribe(&self) -> Receiver<ClientEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.lock_state().connection
    }

    /// Broker pid, while attached
    pub fn server_pid(&self) -> Option<i32> {
        self.shared.lock_state().server_pid
    }

    /// Children registered with this handle, ordered by id
    pub fn children(&self) -> Vec<Child> {
        let mut children: Vec<Child> = self.shared.lock_state().children.values().cloned().collect();
        children.sort_by_key(|c| c.id());
        children
    }

    pub fn child(&self, id: ChildId) -> Option<Child> {
        self.shared.lock_state().children.get(&id).cloned()
    }

    /// Connect to a running broker; completes with its pid
    ///
    /// Fails with `CannotConnect` when nothing listens on the socket.
    pub fn attach(&self, completion: Completion<i32>) {
        self.shared.begin_attach(false, completion);
    }

    /// Connect to the broker, spawning it first if nothing is listening
    ///
    /// Completes immediately with the cached pid when already attached.
    pub fn attach_or_launch_server(&self, completion: Completion<i32>) {
        self.shared.begin_attach(true, completion);
    }

    /// Ask the broker to start a child on a fresh pty
    pub fn launch_child(&self, request: LaunchRequest, completion: Completion<Child>) {
        let pending = PendingRequest::Launch {
            completion,
            deadline: self.shared.deadline(),
        };
        self.shared.submit(Message::LaunchRequest(request), pending);
    }

    /// Poll for a child's termination status
    ///
    /// Answers from the local cache when the status was already delivered. Fails with
    /// `CannotWait` while the child runs; retry after a `ChildTerminated` event. With
    /// `remove_preemptively` the broker forgets the child once its status is out.
    pub fn wait_for_child(
        &self,
        child: &Child,
        remove_preemptively: bool,
        completion: Completion<ExitStatus>,
    ) {
        self.shared.wait_for_child(child, remove_preemptively, completion);
    }

    /// Tear the connection down
    ///
    /// Pending requests fail with `ConnectionLost`; running children become `Unknown`.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for MultiClient {
    fn drop(&mut self) {
        self.shared.close();
    }
}

pub(crate) struct Shared {
    config: ClientConfig,
    state: Mutex<ClientState>,
    subscribers: Mutex<Vec<Sender<ClientEvent>>>,
    next_message_id: AtomicU32,
}

struct ClientState {
    connection: ConnectionState,
    server_pid: Option<i32>,
    /// Bumped on every attach attempt and every disconnect
    generation: u64,
    launch_requested: bool,
    children: HashMap<ChildId, Child>,
    pending: HashMap<MessageId, PendingRequest>,
    attach_waiters: Vec<Completion<i32>>,
    writer: Option<Arc<Mutex<UnixStream>>>,
    /// Separate handle so teardown never waits behind a blocked writer
    socket: Option<UnixStream>,
    link: Option<Arc<ConnectionLink>>,
}

enum PendingRequest {
    Launch {
        completion: Completion<Child>,
        deadline: Instant,
    },
    Wait {
        child: Child,
        remove_preemptively: bool,
        completion: Completion<ExitStatus>,
        deadline: Instant,
    },
}

impl PendingRequest {
    fn deadline(&self) -> Instant {
        match self {
            PendingRequest::Launch { deadline, .. } | PendingRequest::Wait { deadline, .. } => {
                *deadline
            }
        }
    }

    fn fail(self, error: MultiClientError) {
        match self {
            PendingRequest::Launch { completion, .. } => completion.fail(error),
            PendingRequest::Wait {
                child,
                remove_preemptively,
                completion,
                ..
            } => {
                if remove_preemptively {
                    child.status().preemptive_wait_in_flight = false;
                }
                completion.fail(error)
            }
        }
    }
}

/// Emits `ConnectionClosed` once the last party delivering results for a connection lets go
struct ConnectionLink {
    shared: Weak<Shared>,
    generation: u64,
}

impl Drop for ConnectionLink {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            debug!(generation = self.generation, "delivering ConnectionClosed");
            shared.emit(ClientEvent::ConnectionClosed);
        }
    }
}

enum WaitPlan {
    Cached(ExitStatus),
    Fail(MultiClientError),
    Send(Child),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_descriptor_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        lock(&self.state)
    }

    fn next_message_id(&self) -> MessageId {
        loop {
            let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
            if id != UNSOLICITED {
                return id;
            }
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.request_timeout
    }

    fn emit(&self, event: ClientEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    // ---------------------------------------------------------------------
    // Attach
    // ---------------------------------------------------------------------

    fn begin_attach(self: &Arc<Self>, launch: bool, completion: Completion<i32>) {
        let generation = {
            let mut state = self.lock_state();
            match state.connection {
                ConnectionState::Attached => {
                    let pid = state.server_pid;
                    drop(state);
                    match pid {
                        Some(pid) => completion.succeed(pid),
                        None => completion.fail(MultiClientError::connection_lost(
                            "attached without a server pid",
                        )),
                    }
                    return;
                }
                ConnectionState::Attaching => {
                    state.launch_requested |= launch;
                    state.attach_waiters.push(completion);
                    return;
                }
                ConnectionState::Disconnected => {
                    state.connection = ConnectionState::Attaching;
                    state.generation += 1;
                    state.launch_requested = launch;
                    state.attach_waiters.push(completion);
                    state.generation
                }
            }
        };

        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("ptybroker-attach".to_string())
            .spawn(move || shared.run_attach(generation));
        if let Err(e) = spawned {
            self.finish_attach_failed(
                generation,
                MultiClientError::new(ErrorKind::Io, format!("cannot spawn attach thread: {}", e)),
            );
        }
    }

    fn run_attach(self: Arc<Self>, generation: u64) {
        let attached = self
            .connect()
            .and_then(|stream| self.handshake(stream));
        match attached {
            Ok((writer, reader, response)) => self.install(generation, writer, reader, response),
            Err(err) => self.finish_attach_failed(generation, err),
        }
    }

    fn connect(&self) -> BrokerResult<UnixStream> {
        let path = &self.config.socket_path;
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(e) if is_descriptor_exhaustion(&e) => {
                return Err(MultiClientError::new(
                    ErrorKind::Io,
                    format!("cannot create socket: {}", e),
                ))
            }
            Err(e) => {
                if !self.lock_state().launch_requested {
                    return Err(MultiClientError::new(
                        ErrorKind::CannotConnect,
                        format!("no broker listening at {}: {}", path.display(), e),
                    ));
                }
                debug!(socket = %path.display(), error = %e, "no broker listening, launching one");
            }
        }

        self.launch_server()?;

        let deadline = Instant::now() + self.config.launch_timeout;
        loop {
            match UnixStream::connect(path) {
                Ok(stream) => return Ok(stream),
                Err(e) if is_descriptor_exhaustion(&e) => {
                    return Err(MultiClientError::new(
                        ErrorKind::Io,
                        format!("cannot create socket: {}", e),
                    ))
                }
                Err(e) if Instant::now() >= deadline => {
                    return Err(MultiClientError::new(
                        ErrorKind::CannotConnect,
                        format!(
                            "broker did not start listening at {} within {:?}: {}",
                            path.display(),
                            self.config.launch_timeout,
                            e
                        ),
                    ))
                }
                Err(_) => thread::sleep(LAUNCH_POLL_INTERVAL),
            }
        }
    }

    /// Spawn the broker in its own process group so it outlives this process
    fn launch_server(&self) -> BrokerResult<()> {
        let socket = &self.config.socket_path;
        if let Some(dir) = socket.parent() {
            if !dir.as_os_str().is_empty() {
                if let Err(e) = fs::create_dir_all(dir) {
                    warn!(dir = %dir.display(), error = %e, "cannot create socket directory");
                }
            }
        }

        let stderr = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file_path(socket))
            .map(Stdio::from)
            .unwrap_or_else(|_| Stdio::null());

        let mut broker = Command::new(&self.config.server_executable)
            .arg("start")
            .arg("--socket")
            .arg(socket)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|e| {
                MultiClientError::new(
                    ErrorKind::ForkFailed,
                    format!(
                        "cannot launch broker {}: {}",
                        self.config.server_executable.display(),
                        e
                    ),
                )
            })?;

        info!(pid = broker.id(), socket = %socket.display(), "launched broker");

        // Reap it whenever it exits so it does not linger as a zombie.
        let reaper = thread::Builder::new()
            .name("ptybroker-broker-reaper".to_string())
            .spawn(move || {
                let _ = broker.wait();
            });
        if let Err(e) = reaper {
            warn!(error = %e, "cannot spawn broker reaper thread");
        }
        Ok(())
    }

    fn handshake(&self, stream: UnixStream) -> BrokerResult<(UnixStream, FdReader, AttachResponse)> {
        let io_err = |e: io::Error| MultiClientError::from_io(&e);

        stream
            .set_read_timeout(Some(self.config.request_timeout))
            .map_err(io_err)?;
        let mut writer = stream.try_clone().map_err(io_err)?;

        let id = self.next_message_id();
        let request = Message::AttachRequest(AttachRequest {
            client_pid: std::process::id() as i32,
        });
        write_message(&mut writer, &request, id).map_err(io_err)?;

        let mut reader = FdReader::new(stream);
        let (message, reply_id, _) = reader.read_frame().map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => MultiClientError::new(
                ErrorKind::TimedOut,
                "broker did not answer the attach request",
            ),
            _ => MultiClientError::from_io(&e),
        })?;

        let response = match message {
            Message::AttachResponse(response) if reply_id == id => response,
            other => {
                return Err(MultiClientError::protocol(format!(
                    "expected AttachResponse for request {}, got {} for {}",
                    id,
                    other.name(),
                    reply_id
                )))
            }
        };

        reader.get_ref().set_read_timeout(None).map_err(io_err)?;
        Ok((writer, reader, response))
    }

    fn install(
        self: Arc<Self>,
        generation: u64,
        writer: UnixStream,
        reader: FdReader,
        response: AttachResponse,
    ) {
        let link = Arc::new(ConnectionLink {
            shared: Arc::downgrade(&self),
            generation,
        });
        let socket = match writer.try_clone() {
            Ok(socket) => socket,
            Err(e) => {
                self.finish_attach_failed(generation, MultiClientError::from_io(&e));
                return;
            }
        };

        let waiters = {
            let mut state = self.lock_state();
            if state.generation != generation || state.connection != ConnectionState::Attaching {
                // Closed while the handshake was in flight; waiters were already failed.
                let _ = socket.shutdown(Shutdown::Both);
                return;
            }
            state.connection = ConnectionState::Attached;
            state.server_pid = Some(response.server_pid);
            state.launch_requested = false;
            state.writer = Some(Arc::new(Mutex::new(writer)));
            state.socket = Some(socket);
            state.link = Some(Arc::clone(&link));
            std::mem::take(&mut state.attach_waiters)
        };

        let reader_shared = Arc::clone(&self);
        let reader_link = Arc::clone(&link);
        let reader_thread = thread::Builder::new()
            .name("ptybroker-reader".to_string())
            .spawn(move || reader_shared.read_loop(generation, reader, reader_link));

        let watchdog_shared = Arc::downgrade(&self);
        let watchdog_link = Arc::downgrade(&link);
        let tick = (self.config.request_timeout / 4)
            .clamp(Duration::from_millis(5), MAX_WATCHDOG_TICK);
        let watchdog_thread = thread::Builder::new()
            .name("ptybroker-watchdog".to_string())
            .spawn(move || watch_deadlines(watchdog_shared, watchdog_link, generation, tick));

        // `link` outlives the waiter callbacks so ConnectionClosed cannot overtake them.
        if let Err(e) = reader_thread.and_then(|_| watchdog_thread) {
            let err = MultiClientError::new(ErrorKind::Io, format!("cannot spawn connection thread: {}", e));
            self.disconnect(generation, err.clone());
            for waiter in waiters {
                waiter.fail(err.clone());
            }
            drop(link);
            return;
        }

        info!(
            server_pid = response.server_pid,
            children = response.child_count,
            socket = %self.config.socket_path.display(),
            "attached to broker"
        );
        for waiter in waiters {
            waiter.succeed(response.server_pid);
        }
        drop(link);
    }

    fn finish_attach_failed(&self, generation: u64, err: MultiClientError) {
        let waiters = {
            let mut state = self.lock_state();
            if state.generation != generation || state.connection != ConnectionState::Attaching {
                return;
            }
            state.connection = ConnectionState::Disconnected;
            state.launch_requested = false;
            std::mem::take(&mut state.attach_waiters)
        };

        warn!(error = %err, socket = %self.config.socket_path.display(), "attach failed");
        for waiter in waiters {
            waiter.fail(err.clone());
        }
    }

    // ---------------------------------------------------------------------
    // Requests
    // ---------------------------------------------------------------------

    fn submit(&self, message: Message, pending: PendingRequest) {
        let id = self.next_message_id();
        // An unencodable request never touches the socket; fail only its caller.
        let frame = match encode_message(&message, id) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(id, message = message.name(), error = %e, "cannot encode request");
                pending.fail(MultiClientError::protocol(format!(
                    "cannot encode {}: {}",
                    message.name(),
                    e
                )));
                return;
            }
        };

        let (generation, writer) = {
            let mut state = self.lock_state();
            let writer = match (&state.connection, &state.writer) {
                (ConnectionState::Attached, Some(writer)) => Arc::clone(writer),
                _ => {
                    drop(state);
                    pending.fail(MultiClientError::connection_lost("not attached to a broker"));
                    return;
                }
            };
            // Registered before the write so the reader can never see an unknown id.
            state.pending.insert(id, pending);
            (state.generation, writer)
        };

        let written = {
            let mut stream = lock(&writer);
            stream.write_all(&frame).and_then(|()| stream.flush())
        };
        match written {
            Ok(()) => debug!(id, message = message.name(), "request sent"),
            Err(e) => {
                let own = self.lock_state().pending.remove(&id);
                if let Some(own) = own {
                    own.fail(MultiClientError::new(
                        ErrorKind::Io,
                        format!("failed to send {}: {}", message.name(), e),
                    ));
                }
                self.disconnect(generation, MultiClientError::from_io(&e));
            }
        }
    }

    pub(crate) fn wait_for_child(
        self: &Arc<Self>,
        child: &Child,
        remove_preemptively: bool,
        completion: Completion<ExitStatus>,
    ) {
        let plan = {
            let state = self.lock_state();
            if state.connection != ConnectionState::Attached {
                WaitPlan::Fail(MultiClientError::connection_lost("not attached to a broker"))
            } else if !child.is_owned_by(self) {
                WaitPlan::Fail(MultiClientError::new(
                    ErrorKind::NoSuchChild,
                    format!("child {} belongs to another handle", child.id()),
                ))
            } else {
                match state.children.get(&child.id()) {
                    None => WaitPlan::Fail(MultiClientError::new(
                        ErrorKind::NoSuchChild,
                        format!("child {} is not known on this connection", child.id()),
                    )),
                    Some(registered) => {
                        let mut status = registered.status();
                        let recorded = status.state.exit_status();
                        if status.waited && recorded.is_none() {
                            WaitPlan::Fail(MultiClientError::new(
                                ErrorKind::Unknown,
                                format!("child {} was waited without a status", child.id()),
                            ))
                        } else if let Some(exit) =
                            recorded.filter(|_| status.waited || !remove_preemptively)
                        {
                            // A recorded termination answers every plain wait; only a
                            // preemptive wait still has to tell the broker to forget the child.
                            WaitPlan::Cached(exit)
                        } else if status.preemptive_wait_in_flight {
                            WaitPlan::Fail(MultiClientError::new(
                                ErrorKind::PreemptiveWaitResponse,
                                format!("a preemptive wait for child {} is in flight", child.id()),
                            ))
                        } else {
                            if remove_preemptively {
                                status.preemptive_wait_in_flight = true;
                            }
                            drop(status);
                            WaitPlan::Send(registered.clone())
                        }
                    }
                }
            }
        };

        match plan {
            WaitPlan::Cached(status) => {
                debug!(child = child.id(), "wait answered from cache");
                completion.succeed(status);
            }
            WaitPlan::Fail(err) => completion.fail(err),
            WaitPlan::Send(registered) => {
                let message = Message::WaitRequest(WaitRequest {
                    child_id: registered.id(),
                    remove_preemptively,
                });
                let pending = PendingRequest::Wait {
                    child: registered,
                    remove_preemptively,
                    completion,
                    deadline: self.deadline(),
                };
                self.submit(message, pending);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Reader
    // ---------------------------------------------------------------------

    fn read_loop(self: Arc<Self>, generation: u64, mut reader: FdReader, link: Arc<ConnectionLink>) {
        loop {
            match reader.read_frame() {
                Ok((message, id, fd)) => {
                    if !self.dispatch(generation, message, id, fd) {
                        break;
                    }
                }
                Err(e) => {
                    self.disconnect(generation, MultiClientError::from_io(&e));
                    break;
                }
            }
        }
        debug!(generation, "reader exiting");
        drop(link);
    }

    /// Route one frame; false once the connection has been superseded
    fn dispatch(
        self: &Arc<Self>,
        generation: u64,
        message: Message,
        id: MessageId,
        fd: Option<OwnedFd>,
    ) -> bool {
        match message {
            Message::LaunchResponse(response) => self.on_launch_response(generation, id, response, fd),
            Message::LaunchError(error) => self.on_launch_error(generation, id, error),
            Message::WaitResponse(response) => self.on_wait_response(generation, id, response),
            Message::WaitError(error) => self.on_wait_error(generation, id, error),
            Message::ChildDiscovered(report) => self.on_child_discovered(generation, report, fd),
            Message::ChildTerminated(terminated) => {
                let state = self.lock_state();
                if state.generation != generation {
                    return false;
                }
                let known = state.children.get(&terminated.child_id).cloned();
                match known {
                    Some(child) => {
                        child.record_terminated(terminated.status);
                        debug!(child = child.id(), status = terminated.status.raw(), "child terminated");
                        self.emit(ClientEvent::ChildTerminated(child));
                    }
                    None => debug!(child = terminated.child_id, "termination of a child we never saw"),
                }
                true
            }
            other => {
                self.disconnect(
                    generation,
                    MultiClientError::protocol(format!("broker sent a {} frame", other.name())),
                );
                false
            }
        }
    }

    /// Remove the pending request `id`; `Err` when the connection was superseded
    fn take_pending(&self, generation: u64, id: MessageId) -> Result<Option<PendingRequest>, ()> {
        let mut state = self.lock_state();
        if state.generation != generation {
            return Err(());
        }
        Ok(state.pending.remove(&id))
    }

    fn mismatched(&self, generation: u64, id: MessageId, got: &str, pending: PendingRequest) -> bool {
        let err = MultiClientError::protocol(format!("{} answered a different request ({})", got, id));
        pending.fail(err.clone());
        self.disconnect(generation, err);
        false
    }

    fn on_launch_response(
        self: &Arc<Self>,
        generation: u64,
        id: MessageId,
        response: LaunchResponse,
        fd: Option<OwnedFd>,
    ) -> bool {
        let completion = match self.take_pending(generation, id) {
            Err(()) => return false,
            Ok(Some(PendingRequest::Launch { completion, .. })) => completion,
            Ok(Some(other)) => return self.mismatched(generation, id, "LaunchResponse", other),
            Ok(None) => {
                warn!(id, child = response.child_id, "launch response for an expired request");
                return true;
            }
        };

        let child = Child::new(
            response.child_id,
            response.pid,
            response.executable,
            ChildState::Running,
            fd,
            Arc::downgrade(self),
        );
        {
            let mut state = self.lock_state();
            if state.generation != generation {
                drop(state);
                child.mark_unknown();
                completion.fail(MultiClientError::connection_lost(
                    "connection closed while the launch response was processed",
                ));
                return false;
            }
            state.children.insert(child.id(), child.clone());
        }
        debug!(child = child.id(), pid = child.pid(), "child launched");
        completion.succeed(child);
        true
    }

    fn on_launch_error(&self, generation: u64, id: MessageId, error: RequestError) -> bool {
        match self.take_pending(generation, id) {
            Err(()) => false,
            Ok(Some(PendingRequest::Launch { completion, .. })) => {
                debug!(id, kind = %error.kind, "launch failed");
                completion.fail(MultiClientError::new(error.kind, error.message));
                true
            }
            Ok(Some(other)) => self.mismatched(generation, id, "LaunchError", other),
            Ok(None) => {
                warn!(id, "launch error for an expired request");
                true
            }
        }
    }

    fn on_wait_response(&self, generation: u64, id: MessageId, response: WaitResponse) -> bool {
        match self.take_pending(generation, id) {
            Err(()) => false,
            Ok(Some(PendingRequest::Wait {
                child, completion, ..
            })) => {
                child.record_waited(response.status);
                completion.succeed(response.status);
                true
            }
            Ok(Some(other)) => self.mismatched(generation, id, "WaitResponse", other),
            Ok(None) => {
                warn!(id, child = response.child_id, "wait response for an expired request");
                true
            }
        }
    }

    fn on_wait_error(&self, generation: u64, id: MessageId, error: RequestError) -> bool {
        match self.take_pending(generation, id) {
            Err(()) => false,
            Ok(Some(PendingRequest::Wait {
                child,
                remove_preemptively,
                completion,
                ..
            })) => {
                let cached = {
                    let mut status = child.status();
                    status.preemptive_wait_in_flight = false;
                    if remove_preemptively && error.kind == ErrorKind::CannotWait {
                        status.removal_requested = true;
                    }
                    if error.kind == ErrorKind::AlreadyWaited {
                        status.state.exit_status()
                    } else {
                        None
                    }
                };
                match cached {
                    Some(status) => completion.succeed(status),
                    None => completion.fail(MultiClientError::new(error.kind, error.message)),
                }
                true
            }
            Ok(Some(other)) => self.mismatched(generation, id, "WaitError", other),
            Ok(None) => {
                warn!(id, "wait error for an expired request");
                true
            }
        }
    }

    fn on_child_discovered(
        self: &Arc<Self>,
        generation: u64,
        report: ChildReport,
        fd: Option<OwnedFd>,
    ) -> bool {
        let mut state = self.lock_state();
        if state.generation != generation {
            return false;
        }
        if state.children.contains_key(&report.child_id) {
            return true;
        }

        let child_state = match report.status {
            Some(status) => ChildState::Terminated(status),
            None => ChildState::Running,
        };
        let child = Child::new(
            report.child_id,
            report.pid,
            report.executable,
            child_state,
            fd,
            Arc::downgrade(self),
        );
        state.children.insert(child.id(), child.clone());
        debug!(child = child.id(), pid = child.pid(), "child discovered");
        self.emit(ClientEvent::ChildDiscovered(child));
        true
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    fn disconnect(&self, generation: u64, cause: MultiClientError) {
        let (pending, children, socket, link) = {
            let mut state = self.lock_state();
            if state.generation != generation || state.connection != ConnectionState::Attached {
                return;
            }
            state.connection = ConnectionState::Disconnected;
            state.generation += 1;
            state.server_pid = None;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.children),
                {
                    state.writer = None;
                    state.socket.take()
                },
                state.link.take(),
            )
        };

        if let Some(socket) = socket {
            // Wakes the reader if it is blocked on this socket.
            let _ = socket.shutdown(Shutdown::Both);
        }

        if cause.kind() == ErrorKind::ConnectionLost {
            info!(reason = %cause, "broker connection closed");
        } else {
            warn!(reason = %cause, "broker connection failed");
        }

        for child in children.values() {
            child.mark_unknown();
        }

        let lost = if cause.kind() == ErrorKind::ConnectionLost {
            cause
        } else {
            MultiClientError::connection_lost(cause.to_string())
        };
        for (_, request) in pending {
            request.fail(lost.clone());
        }

        drop(link);
    }

    fn close(&self) {
        let (attached, waiters) = {
            let mut state = self.lock_state();
            match state.connection {
                ConnectionState::Disconnected => return,
                ConnectionState::Attached => (Some(state.generation), Vec::new()),
                ConnectionState::Attaching => {
                    state.connection = ConnectionState::Disconnected;
                    state.generation += 1;
                    state.launch_requested = false;
                    (None, std::mem::take(&mut state.attach_waiters))
                }
            }
        };

        match attached {
            Some(generation) => self.disconnect(
                generation,
                MultiClientError::connection_lost("connection closed by client"),
            ),
            None => {
                for waiter in waiters {
                    waiter.fail(MultiClientError::connection_lost("attach cancelled by close"));
                }
            }
        }
    }
}

/// Expire requests the broker did not answer in time
fn watch_deadlines(
    shared: Weak<Shared>,
    link: Weak<ConnectionLink>,
    generation: u64,
    tick: Duration,
) {
    loop {
        thread::sleep(tick);
        let Some(shared) = shared.upgrade() else { return };
        let Some(_link) = link.upgrade() else { return };

        let expired: Vec<(MessageId, PendingRequest)> = {
            let mut state = shared.lock_state();
            if state.generation != generation {
                return;
            }
            let now = Instant::now();
            let ids: Vec<MessageId> = state
                .pending
                .iter()
                .filter(|(_, request)| request.deadline() <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.pending.remove(&id).map(|request| (id, request)))
                .collect()
        };

        for (id, request) in expired {
            warn!(id, timeout = ?shared.config.request_timeout, "request timed out");
            request.fail(MultiClientError::new(
                ErrorKind::TimedOut,
                format!("no answer within {:?}", shared.config.request_timeout),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::protocol::{read_message, ChildTerminated};
    use std::os::unix::net::UnixListener;
    use tempfile::TempDir;

    /// Minimal scripted broker: answers the handshake, then hands the raw stream to the test
    fn fake_broker(dir: &TempDir, children: u32) -> (std::path::PathBuf, thread::JoinHandle<UnixStream>) {
        let path = dir.path().join("fake.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let (message, id) = read_message(&mut stream).unwrap();
            assert!(matches!(message, Message::AttachRequest(_)));
            write_message(
                &mut stream,
                &Message::AttachResponse(AttachResponse {
                    server_pid: 4242,
                    child_count: children,
                }),
                id,
            )
            .unwrap();
            stream
        });
        (path, handle)
    }

    fn attached(path: &std::path::Path) -> MultiClient {
        let client = MultiClient::new(
            ClientConfig::new(path).with_request_timeout(Duration::from_secs(5)),
        );
        let (completion, pending) = Completion::channel();
        client.attach(completion);
        assert_eq!(pending.wait().unwrap(), 4242);
        client
    }

    #[test]
    fn test_attach_without_broker_cannot_connect() {
        let dir = TempDir::new().unwrap();
        let client = MultiClient::with_socket_path(dir.path().join("missing.sock"));
        let (completion, pending) = Completion::channel();
        client.attach(completion);
        assert_eq!(pending.wait().unwrap_err().kind(), ErrorKind::CannotConnect);
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_requests_before_attach_fail_immediately() {
        let dir = TempDir::new().unwrap();
        let client = MultiClient::with_socket_path(dir.path().join("missing.sock"));
        let (completion, pending) = Completion::channel();
        client.launch_child(LaunchRequest::new("/bin/sh"), completion);
        assert_eq!(pending.wait().unwrap_err().kind(), ErrorKind::ConnectionLost);
    }

    #[test]
    fn test_attach_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (path, broker) = fake_broker(&dir, 0);
        let client = attached(&path);
        let _stream = broker.join().unwrap();

        let (completion, pending) = Completion::channel();
        client.attach_or_launch_server(completion);
        assert_eq!(pending.wait().unwrap(), 4242);
        assert_eq!(client.server_pid(), Some(4242));
    }

    #[test]
    fn test_close_fails_pending_then_emits_closed() {
        let dir = TempDir::new().unwrap();
        let (path, broker) = fake_broker(&dir, 0);
        let client = attached(&path);
        let events = client.subscribe();
        let mut stream = broker.join().unwrap();

        let (completion, pending) = Completion::channel();
        client.launch_child(LaunchRequest::new("/bin/sh"), completion);
        // Make sure the request reached the broker before closing.
        let (message, _) = read_message(&mut stream).unwrap();
        assert!(matches!(message, Message::LaunchRequest(_)));

        client.close();
        assert_eq!(pending.wait().unwrap_err().kind(), ErrorKind::ConnectionLost);

        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, ClientEvent::ConnectionClosed));
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());

        let (completion, pending) = Completion::channel();
        client.launch_child(LaunchRequest::new("/bin/sh"), completion);
        assert_eq!(pending.wait().unwrap_err().kind(), ErrorKind::ConnectionLost);
    }

    #[test]
    fn test_broker_hangup_is_connection_lost() {
        let dir = TempDir::new().unwrap();
        let (path, broker) = fake_broker(&dir, 0);
        let client = attached(&path);
        let events = client.subscribe();
        let mut stream = broker.join().unwrap();

        let (completion, pending) = Completion::channel();
        client.launch_child(LaunchRequest::new("/bin/sh"), completion);
        let _ = read_message(&mut stream).unwrap();
        drop(stream);

        assert_eq!(pending.wait().unwrap_err().kind(), ErrorKind::ConnectionLost);
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, ClientEvent::ConnectionClosed));
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_garbage_frame_tears_down_connection() {
        let dir = TempDir::new().unwrap();
        let (path, broker) = fake_broker(&dir, 0);
        let client = attached(&path);
        let events = client.subscribe();
        let mut stream = broker.join().unwrap();

        use std::io::Write;
        stream.write_all(&8u32.to_le_bytes()).unwrap();
        stream.write_all(&0u32.to_le_bytes()).unwrap();
        stream.write_all(&[0xff; 4]).unwrap();

        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, ClientEvent::ConnectionClosed));
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_request_times_out() {
        let dir = TempDir::new().unwrap();
        let (path, broker) = fake_broker(&dir, 0);
        let client = MultiClient::new(
            ClientConfig::new(&path).with_request_timeout(Duration::from_millis(150)),
        );
        let (completion, pending) = Completion::channel();
        client.attach(completion);
        assert_eq!(pending.wait().unwrap(), 4242);
        let _stream = broker.join().unwrap();

        let (completion, pending) = Completion::channel();
        client.launch_child(LaunchRequest::new("/bin/sh"), completion);
        let err = pending.wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        // A timeout does not cost the connection.
        assert_eq!(client.connection_state(), ConnectionState::Attached);
    }

    #[test]
    fn test_discovery_and_cached_wait() {
        let dir = TempDir::new().unwrap();
        let (path, broker) = fake_broker(&dir, 1);
        let client = MultiClient::new(ClientConfig::new(&path));
        let events = client.subscribe();
        let (completion, pending) = Completion::channel();
        client.attach(completion);
        assert_eq!(pending.wait().unwrap(), 4242);
        let mut stream = broker.join().unwrap();

        write_message(
            &mut stream,
            &Message::ChildDiscovered(ChildReport {
                child_id: 9,
                pid: 777,
                executable: "/bin/zsh".to_string(),
                status: None,
                pty_fd: false,
            }),
            UNSOLICITED,
        )
        .unwrap();

        let child = match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            ClientEvent::ChildDiscovered(child) => child,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(child.id(), 9);
        assert_eq!(child.pid(), 777);
        assert!(child.is_running());

        write_message(
            &mut stream,
            &Message::ChildTerminated(ChildTerminated {
                child_id: 9,
                status: ExitStatus::from_code(5),
            }),
            UNSOLICITED,
        )
        .unwrap();
        assert!(matches!(
            events.recv_timeout(Duration::from_secs(5)).unwrap(),
            ClientEvent::ChildTerminated(_)
        ));

        // A recorded termination answers plain waits without asking the broker.
        stream.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        for _ in 0..2 {
            let (completion, pending) = Completion::channel();
            child.wait(false, completion);
            assert_eq!(pending.wait().unwrap(), ExitStatus::from_code(5));
        }
        assert!(read_message(&mut stream).is_err());
        assert!(!child.has_waited());

        // A preemptive wait still goes out so the broker can forget the child.
        stream.set_read_timeout(None).unwrap();
        let (completion, pending) = Completion::channel();
        client.wait_for_child(&child, true, completion);
        let (message, id) = read_message(&mut stream).unwrap();
        assert_eq!(
            message,
            Message::WaitRequest(WaitRequest {
                child_id: 9,
                remove_preemptively: true
            })
        );
        write_message(
            &mut stream,
            &Message::WaitResponse(WaitResponse {
                child_id: 9,
                status: ExitStatus::from_code(5),
            }),
            id,
        )
        .unwrap();
        assert_eq!(pending.wait().unwrap(), ExitStatus::from_code(5));
        assert!(child.has_waited());
    }

    #[test]
    fn test_child_discovered_terminated_answers_from_cache() {
        let dir = TempDir::new().unwrap();
        let (path, broker) = fake_broker(&dir, 1);
        let client = MultiClient::new(ClientConfig::new(&path));
        let events = client.subscribe();
        let (completion, pending) = Completion::channel();
        client.attach(completion);
        pending.wait().unwrap();
        let mut stream = broker.join().unwrap();

        write_message(
            &mut stream,
            &Message::ChildDiscovered(ChildReport {
                child_id: 4,
                pid: 400,
                executable: "/bin/sh".to_string(),
                status: Some(ExitStatus::from_signal(9, false)),
                pty_fd: false,
            }),
            UNSOLICITED,
        )
        .unwrap();
        let child = match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            ClientEvent::ChildDiscovered(child) => child,
            other => panic!("unexpected event {:?}", other),
        };

        let (completion, pending) = Completion::channel();
        child.wait(false, completion);
        assert_eq!(pending.wait().unwrap().signal(), Some(9));
        stream.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        assert!(read_message(&mut stream).is_err());
    }

    #[test]
    fn test_attach_completes_before_connection_closed() {
        for _ in 0..50 {
            let dir = TempDir::new().unwrap();
            let (path, broker) = fake_broker(&dir, 0);
            // The broker hangs up as soon as the handshake is answered.
            let hangup = thread::spawn(move || drop(broker.join().unwrap()));

            let client = MultiClient::with_socket_path(&path);
            let events = client.subscribe();
            let (tx, rx) = mpsc::channel();
            client.attach(Completion::new(move |result: BrokerResult<i32>| {
                let closed_first = matches!(events.try_recv(), Ok(ClientEvent::ConnectionClosed));
                let _ = tx.send((result, closed_first, events));
            }));

            let (result, closed_first, events) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(result.unwrap(), 4242);
            assert!(!closed_first, "ConnectionClosed overtook the attach completion");
            hangup.join().unwrap();
            assert!(matches!(
                events.recv_timeout(Duration::from_secs(5)).unwrap(),
                ClientEvent::ConnectionClosed
            ));
        }
    }

    #[test]
    fn test_oversized_request_fails_alone() {
        let dir = TempDir::new().unwrap();
        let (path, broker) = fake_broker(&dir, 0);
        let client = attached(&path);
        let mut stream = broker.join().unwrap();

        let (completion, in_flight) = Completion::channel();
        client.launch_child(LaunchRequest::new("/bin/sh"), completion);
        let (_, in_flight_id) = read_message(&mut stream).unwrap();

        let huge: Vec<(String, String)> = (0..120_000)
            .map(|i| (format!("VAR_{}", i), "x".repeat(100)))
            .collect();
        let (completion, oversized) = Completion::channel();
        client.launch_child(LaunchRequest::new("/bin/sh").with_environment(huge), completion);
        assert_eq!(oversized.wait().unwrap_err().kind(), ErrorKind::ProtocolError);
        assert_eq!(client.connection_state(), ConnectionState::Attached);

        write_message(
            &mut stream,
            &Message::LaunchError(RequestError {
                kind: ErrorKind::ForkFailed,
                message: "no".to_string(),
            }),
            in_flight_id,
        )
        .unwrap();
        assert_eq!(in_flight.wait().unwrap_err().kind(), ErrorKind::ForkFailed);
    }

    #[test]
    fn test_late_response_after_timeout_is_dropped() {
        let dir = TempDir::new().unwrap();
        let (path, broker) = fake_broker(&dir, 0);
        let client = MultiClient::new(
            ClientConfig::new(&path).with_request_timeout(Duration::from_millis(300)),
        );
        let (completion, pending) = Completion::channel();
        client.attach(completion);
        pending.wait().unwrap();
        let mut stream = broker.join().unwrap();

        let (completion, expired) = Completion::channel();
        client.launch_child(LaunchRequest::new("/bin/sh"), completion);
        let (_, expired_id) = read_message(&mut stream).unwrap();
        assert_eq!(expired.wait().unwrap_err().kind(), ErrorKind::TimedOut);

        // The answer shows up anyway, followed by a request that is answered in time.
        let launched = |child_id| {
            Message::LaunchResponse(LaunchResponse {
                child_id,
                pid: 1000 + child_id as i32,
                executable: "/bin/sh".to_string(),
                pty_fd: false,
            })
        };
        write_message(&mut stream, &launched(1), expired_id).unwrap();

        let (completion, answered) = Completion::channel();
        client.launch_child(LaunchRequest::new("/bin/sh"), completion);
        let (_, id) = read_message(&mut stream).unwrap();
        assert_ne!(id, expired_id);
        write_message(&mut stream, &launched(2), id).unwrap();

        assert_eq!(answered.wait().unwrap().id(), 2);
        assert_eq!(client.connection_state(), ConnectionState::Attached);
        let ids: Vec<ChildId> = client.children().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_concurrent_wait_during_preemptive_wait() {
        let dir = TempDir::new().unwrap();
        let (path, broker) = fake_broker(&dir, 1);
        let client = MultiClient::new(ClientConfig::new(&path));
        let events = client.subscribe();
        let (completion, pending) = Completion::channel();
        client.attach(completion);
        pending.wait().unwrap();
        let mut stream = broker.join().unwrap();

        write_message(
            &mut stream,
            &Message::ChildDiscovered(ChildReport {
                child_id: 3,
                pid: 300,
                executable: "/bin/sh".to_string(),
                status: None,
                pty_fd: false,
            }),
            UNSOLICITED,
        )
        .unwrap();
        let child = match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            ClientEvent::ChildDiscovered(child) => child,
            other => panic!("unexpected event {:?}", other),
        };

        let (first, first_pending) = Completion::channel();
        client.wait_for_child(&child, true, first);
        let (second, second_pending) = Completion::channel();
        client.wait_for_child(&child, false, second);
        assert_eq!(
            second_pending.wait().unwrap_err().kind(),
            ErrorKind::PreemptiveWaitResponse
        );

        let (_, id) = read_message(&mut stream).unwrap();
        write_message(
            &mut stream,
            &Message::WaitError(RequestError {
                kind: ErrorKind::CannotWait,
                message: "running".to_string(),
            }),
            id,
        )
        .unwrap();
        assert_eq!(first_pending.wait().unwrap_err().kind(), ErrorKind::CannotWait);

        // The broker forgets the child once it reports termination.
        write_message(
            &mut stream,
            &Message::ChildTerminated(ChildTerminated {
                child_id: 3,
                status: ExitStatus::from_code(0),
            }),
            UNSOLICITED,
        )
        .unwrap();
        assert!(matches!(
            events.recv_timeout(Duration::from_secs(5)).unwrap(),
            ClientEvent::ChildTerminated(_)
        ));
        let (completion, pending) = Completion::channel();
        client.wait_for_child(&child, false, completion);
        assert_eq!(pending.wait().unwrap(), ExitStatus::from_code(0));
    }
}
