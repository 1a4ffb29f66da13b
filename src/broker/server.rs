//! Broker server
//!
//! Owns the children and their pty masters. Each attached client gets its own
//! thread; the accept loop polls the listener, reaps children between accepts and
//! watches the shutdown flag set by SIGTERM/SIGINT.

use crate::broker::config::pid_file_path;
use crate::broker::launcher::spawn_on_pty;
use crate::broker::protocol::{
    read_message, write_message_with_fd, AttachResponse, ChildId, ChildReport, ChildTerminated,
    ExitStatus, LaunchRequest, LaunchResponse, Message, MessageId, RequestError, WaitRequest,
    WaitResponse, UNSOLICITED,
};
use crate::error::ErrorKind;
use anyhow::{anyhow, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::net::Shutdown;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Grace period for children to exit after hangup during shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A child the broker launched
#[derive(Debug)]
struct ChildRecord {
    id: ChildId,
    pid: i32,
    executable: String,
    master: OwnedFd,
    status: Option<ExitStatus>,
    /// A wait response carried the status already
    delivered: bool,
    /// Forget the record as soon as its termination has been broadcast
    remove_on_exit: bool,
}

impl ChildRecord {
    fn report(&self) -> ChildReport {
        ChildReport {
            child_id: self.id,
            pid: self.pid,
            executable: self.executable.clone(),
            status: self.status,
            pty_fd: true,
        }
    }
}

#[derive(Debug)]
struct ChildTable {
    records: BTreeMap<ChildId, ChildRecord>,
    next_id: ChildId,
}

/// A frame waiting for the connection's writer thread
#[derive(Debug)]
struct Outbound {
    message: Message,
    message_id: MessageId,
    fd: Option<OwnedFd>,
}

/// One attached client
///
/// Frames are queued and written by a dedicated thread, so a client that stops
/// reading only ever stalls its own writer.
#[derive(Debug)]
struct Connection {
    id: u64,
    outbox: Sender<Outbound>,
}

impl Connection {
    fn spawn(id: u64, stream: UnixStream) -> io::Result<Self> {
        let (outbox, queued) = mpsc::channel();
        thread::Builder::new()
            .name(format!("ptybroker-writer-{}", id))
            .spawn(move || drain_outbox(id, stream, queued))?;
        Ok(Self { id, outbox })
    }

    /// Queue a frame; a descriptor is duplicated so the caller keeps its own
    fn send(&self, message: Message, message_id: MessageId, fd: Option<BorrowedFd<'_>>) -> io::Result<()> {
        let fd = fd.map(|fd| fd.try_clone_to_owned()).transpose()?;
        self.outbox
            .send(Outbound {
                message,
                message_id,
                fd,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection writer has exited"))
    }
}

/// Write queued frames until the connection is dropped or the socket fails
fn drain_outbox(connection_id: u64, mut stream: UnixStream, queued: Receiver<Outbound>) {
    for frame in queued {
        let fd = frame.fd.as_ref().map(|fd| fd.as_fd());
        if let Err(e) = write_message_with_fd(&mut stream, &frame.message, frame.message_id, fd) {
            debug!(connection = connection_id, error = %e, "write failed, hanging up");
            // Wakes the connection's reader so the client is unregistered.
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    }
}

#[derive(Debug)]
struct BrokerState {
    children: Mutex<ChildTable>,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    next_connection_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BrokerState {
    fn new() -> Self {
        Self {
            children: Mutex::new(ChildTable {
                records: BTreeMap::new(),
                next_id: 1,
            }),
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Queue a message for every attached client
    ///
    /// Callers hold the child table lock so broadcasts and attach snapshots do not interleave.
    fn broadcast(&self, message: &Message) {
        for connection in lock(&self.connections).values() {
            if let Err(e) = connection.send(message.clone(), UNSOLICITED, None) {
                debug!(connection = connection.id, error = %e, "broadcast failed");
            }
        }
    }

    /// Poll every running child once
    fn reap_children(&self) {
        let mut table = lock(&self.children);
        let running: Vec<(ChildId, i32)> = table
            .records
            .values()
            .filter(|r| r.status.is_none())
            .map(|r| (r.id, r.pid))
            .collect();

        for (child_id, pid) in running {
            let status = match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => ExitStatus::from_code(code),
                Ok(WaitStatus::Signaled(_, sig, core_dumped)) => {
                    ExitStatus::from_signal(sig as i32, core_dumped)
                }
                Ok(_) => continue,
                Err(Errno::ECHILD) => {
                    warn!(child = child_id, pid, "child vanished without a status");
                    ExitStatus::from_code(255)
                }
                Err(e) => {
                    warn!(child = child_id, pid, error = %e, "waitpid failed");
                    continue;
                }
            };

            info!(child = child_id, pid, status = status.raw(), "child terminated");
            let remove = match table.records.get_mut(&child_id) {
                Some(record) => {
                    record.status = Some(status);
                    record.remove_on_exit
                }
                None => false,
            };
            self.broadcast(&Message::ChildTerminated(ChildTerminated { child_id, status }));
            if remove {
                table.records.remove(&child_id);
                debug!(child = child_id, "forgot child after preemptive wait");
            }
        }
    }

    fn launch(&self, connection: &Connection, message_id: MessageId, request: LaunchRequest) -> io::Result<()> {
        // Held across spawn and insert so a fast exit cannot be reaped before the record exists.
        let mut table = lock(&self.children);
        match spawn_on_pty(&request) {
            Ok(spawned) => {
                let child_id = table.next_id;
                table.next_id += 1;
                info!(
                    child = child_id,
                    pid = spawned.pid,
                    executable = %request.executable_path,
                    "launched child"
                );
                let record = ChildRecord {
                    id: child_id,
                    pid: spawned.pid,
                    executable: request.executable_path,
                    master: spawned.master,
                    status: None,
                    delivered: false,
                    remove_on_exit: false,
                };
                let response = Message::LaunchResponse(LaunchResponse {
                    child_id,
                    pid: record.pid,
                    executable: record.executable.clone(),
                    pty_fd: true,
                });
                let sent = connection.send(response, message_id, Some(record.master.as_fd()));
                table.records.insert(child_id, record);
                sent
            }
            Err(e) => {
                drop(table);
                warn!(executable = %request.executable_path, error = %e, "launch failed");
                let response = Message::LaunchError(RequestError {
                    kind: ErrorKind::ForkFailed,
                    message: format!("cannot launch {}: {}", request.executable_path, e),
                });
                connection.send(response, message_id, None)
            }
        }
    }

    fn wait(&self, connection: &Connection, message_id: MessageId, request: WaitRequest) -> io::Result<()> {
        let mut table = lock(&self.children);
        let child_id = request.child_id;

        let reply = match table.records.get_mut(&child_id) {
            None => Err((ErrorKind::NoSuchChild, format!("no child with id {}", child_id))),
            Some(record) => match record.status {
                Some(status) if !record.delivered => {
                    record.delivered = true;
                    Ok(status)
                }
                Some(_) => Err((
                    ErrorKind::AlreadyWaited,
                    format!("status of child {} was already delivered", child_id),
                )),
                None => {
                    if request.remove_preemptively {
                        record.remove_on_exit = true;
                    }
                    Err((ErrorKind::CannotWait, format!("child {} is still running", child_id)))
                }
            },
        };

        let terminated = matches!(reply, Ok(_) | Err((ErrorKind::AlreadyWaited, _)));
        if terminated && request.remove_preemptively {
            table.records.remove(&child_id);
            debug!(child = child_id, "forgot child after preemptive wait");
        }
        let message = match reply {
            Ok(status) => Message::WaitResponse(WaitResponse { child_id, status }),
            Err((kind, message)) => Message::WaitError(RequestError { kind, message }),
        };
        drop(table);
        connection.send(message, message_id, None)
    }
}

/// Main broker server
pub struct BrokerServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    shutdown: Arc<AtomicBool>,
    state: Arc<BrokerState>,
    /// Read halves of attached clients, shut down on exit
    sockets: Arc<Mutex<HashMap<u64, UnixStream>>>,
}

impl BrokerServer {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            listener: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            state: Arc::new(BrokerState::new()),
            sockets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Flag that stops the accept loop when set
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Install signal handlers, bind, write the pid file and serve until shutdown
    pub fn start(&mut self) -> Result<()> {
        self.setup_signal_handlers()?;
        self.bind()?;
        self.write_pid_file()?;

        info!(socket = %self.socket_path.display(), pid = std::process::id(), "broker started");

        self.serve()
    }

    /// Bind the Unix socket
    pub fn bind(&mut self) -> Result<()> {
        // Remove stale socket if it exists
        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)
                .with_context(|| format!("removing stale socket {}", self.socket_path.display()))?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("binding {}", self.socket_path.display()))?;

        // Owner read/write only
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.socket_path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.socket_path, perms)?;
        }

        self.listener = Some(listener);
        Ok(())
    }

    fn setup_signal_handlers(&self) -> Result<()> {
        signal_hook::flag::register(signal::SIGTERM as i32, self.shutdown.clone())?;
        signal_hook::flag::register(signal::SIGINT as i32, self.shutdown.clone())?;
        Ok(())
    }

    /// Accept loop; returns after the shutdown flag is raised
    pub fn serve(&mut self) -> Result<()> {
        let listener = self.listener.take().ok_or_else(|| anyhow!("Socket not bound"))?;

        // Non-blocking so the shutdown flag is checked between accepts
        listener.set_nonblocking(true)?;

        while !self.shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false)?;
                    if let Err(e) = self.spawn_connection(stream) {
                        error!(error = %e, "error accepting connection");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.state.reap_children();
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    error!(error = %e, "error accepting connection");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }

        info!("shutting down broker");
        self.shutdown_gracefully()
    }

    fn spawn_connection(&self, stream: UnixStream) -> Result<()> {
        let connection_id = self.state.next_connection_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.sockets).insert(connection_id, stream.try_clone()?);

        let state = Arc::clone(&self.state);
        let sockets = Arc::clone(&self.sockets);
        thread::Builder::new()
            .name(format!("ptybroker-conn-{}", connection_id))
            .spawn(move || {
                if let Err(e) = serve_connection(&state, connection_id, stream) {
                    warn!(connection = connection_id, error = %e, "connection failed");
                }
                lock(&state.connections).remove(&connection_id);
                lock(&sockets).remove(&connection_id);
                debug!(connection = connection_id, "connection closed");
            })
            .context("spawning connection thread")?;
        Ok(())
    }

    fn write_pid_file(&self) -> Result<()> {
        let pid_path = pid_file_path(&self.socket_path);
        fs::write(&pid_path, std::process::id().to_string())
            .with_context(|| format!("writing {}", pid_path.display()))?;
        Ok(())
    }

    fn remove_pid_file(&self) -> Result<()> {
        let pid_path = pid_file_path(&self.socket_path);
        if pid_path.exists() {
            fs::remove_file(&pid_path)?;
        }
        Ok(())
    }

    fn shutdown_gracefully(&mut self) -> Result<()> {
        // Clients see their connection drop.
        for (_, socket) in lock(&self.sockets).drain() {
            let _ = socket.shutdown(Shutdown::Both);
        }

        let running: Vec<i32> = lock(&self.state.children)
            .records
            .values()
            .filter(|r| r.status.is_none())
            .map(|r| r.pid)
            .collect();
        if !running.is_empty() {
            info!(children = running.len(), "hanging up running children");
        }
        for pid in &running {
            let _ = signal::kill(Pid::from_raw(*pid), Signal::SIGHUP);
        }

        let start = Instant::now();
        while start.elapsed() < SHUTDOWN_GRACE {
            self.state.reap_children();
            let remaining = lock(&self.state.children)
                .records
                .values()
                .any(|r| r.status.is_none());
            if !remaining {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }

        for record in lock(&self.state.children).records.values() {
            if record.status.is_none() {
                let _ = signal::kill(Pid::from_raw(record.pid), Signal::SIGKILL);
            }
        }
        self.state.reap_children();

        let _ = self.remove_pid_file();
        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)?;
        }
        Ok(())
    }
}

impl Drop for BrokerServer {
    fn drop(&mut self) {
        let _ = self.remove_pid_file();
        if self.socket_path.exists() {
            let _ = fs::remove_file(&self.socket_path);
        }
    }
}

/// Serve one client until it hangs up
fn serve_connection(state: &BrokerState, connection_id: u64, mut stream: UnixStream) -> Result<()> {
    let (message, message_id) = match read_message(&mut stream) {
        Ok(frame) => frame,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
        Err(e) => return Err(anyhow!("Failed to read handshake: {}", e)),
    };
    let client_pid = match message {
        Message::AttachRequest(request) => request.client_pid,
        other => return Err(anyhow!("expected AttachRequest, got {}", other.name())),
    };

    let connection = Arc::new(Connection::spawn(connection_id, stream.try_clone()?)?);

    // Snapshot and registration under the table lock: every child is either
    // reported here or announced later by a broadcast, never both or neither.
    {
        let table = lock(&state.children);
        let response = Message::AttachResponse(AttachResponse {
            server_pid: std::process::id() as i32,
            child_count: table.records.len() as u32,
        });
        connection.send(response, message_id, None)?;
        for record in table.records.values() {
            connection.send(
                Message::ChildDiscovered(record.report()),
                UNSOLICITED,
                Some(record.master.as_fd()),
            )?;
        }
        lock(&state.connections).insert(connection_id, Arc::clone(&connection));
        info!(
            connection = connection_id,
            client_pid,
            children = table.records.len(),
            "client attached"
        );
    }

    loop {
        let (message, message_id) = match read_message(&mut stream) {
            Ok(frame) => frame,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::BrokenPipe
                ) =>
            {
                info!(connection = connection_id, "client detached");
                return Ok(());
            }
            Err(e) => return Err(anyhow!("Failed to read message: {}", e)),
        };

        match message {
            Message::LaunchRequest(request) => state.launch(&connection, message_id, request)?,
            Message::WaitRequest(request) => state.wait(&connection, message_id, request)?,
            Message::AttachRequest(_) => {
                warn!(connection = connection_id, "duplicate attach request ignored");
            }
            other => {
                return Err(anyhow!("unexpected {} from client", other.name()));
            }
        }
    }
}
