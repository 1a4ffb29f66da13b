//! Broker wire protocol
//!
//! Length-prefixed binary frames over a Unix stream socket:
//!
//! ```text
//! ┌────────────┬──────────────┬──────────────────────┐
//! │   Length   │  Message ID  │  Payload (bincode)   │
//! │  (4 bytes) │  (4 bytes)   │  (variable length)   │
//! └────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! Requests carry a client-chosen message id which the broker echoes on the response.
//! Unsolicited broker messages (`ChildDiscovered`, `ChildTerminated`) use id 0.
//!
//! Pty master descriptors travel as `SCM_RIGHTS` ancillary data attached to the
//! frame that announces them (`pty_fd: true`). [`FdReader`] reads every byte with
//! `recvmsg` and queues whatever descriptors arrive, so the decoder can pop one when
//! it sees the flag regardless of how the kernel split the stream.

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Maximum message size (10MB to prevent memory exhaustion)
const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

/// Upper bound on descriptors accepted from a single `recvmsg`
const MAX_FDS_PER_READ: usize = 8;

/// Request/response correlation id
pub type MessageId = u32;

/// Broker-assigned child identifier, unique for the broker's lifetime
pub type ChildId = u64;

/// Message id used for messages nobody asked for
pub const UNSOLICITED: MessageId = 0;

/// Message envelope containing all possible message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Client handshake
    AttachRequest(AttachRequest),
    /// Broker handshake answer
    AttachResponse(AttachResponse),
    /// Client asks the broker to spawn a child on a new pty
    LaunchRequest(LaunchRequest),
    /// Child spawned; the pty master descriptor rides along
    LaunchResponse(LaunchResponse),
    /// Child could not be spawned
    LaunchError(RequestError),
    /// Client polls for a child's termination status
    WaitRequest(WaitRequest),
    /// Terminal status of a child
    WaitResponse(WaitResponse),
    /// Wait could not be answered with a status
    WaitError(RequestError),
    /// A child that existed before this connection attached (unsolicited)
    ChildDiscovered(ChildReport),
    /// A child was reaped by the broker (unsolicited)
    ChildTerminated(ChildTerminated),
}

impl Message {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Message::AttachRequest(_) => "AttachRequest",
            Message::AttachResponse(_) => "AttachResponse",
            Message::LaunchRequest(_) => "LaunchRequest",
            Message::LaunchResponse(_) => "LaunchResponse",
            Message::LaunchError(_) => "LaunchError",
            Message::WaitRequest(_) => "WaitRequest",
            Message::WaitResponse(_) => "WaitResponse",
            Message::WaitError(_) => "WaitError",
            Message::ChildDiscovered(_) => "ChildDiscovered",
            Message::ChildTerminated(_) => "ChildTerminated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachRequest {
    /// Pid of the attaching client (diagnostics only)
    pub client_pid: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachResponse {
    /// Broker process id
    pub server_pid: i32,
    /// Number of `ChildDiscovered` frames that follow
    pub child_count: u32,
}

/// Terminal configuration applied to the pty before the child starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtyConfig {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
    /// Set IUTF8 on the line discipline
    pub utf8: bool,
}

impl Default for TtyConfig {
    fn default() -> Self {
        Self {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
            utf8: true,
        }
    }
}

/// Everything the broker needs to start a child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Path passed to exec
    pub executable_path: String,
    /// Full argument vector, argv[0] included
    pub argv: Vec<String>,
    /// Complete environment of the child
    pub environment: Vec<(String, String)>,
    /// Working directory of the child
    pub working_dir: String,
    pub tty: TtyConfig,
}

impl LaunchRequest {
    /// Request with argv = [path], empty environment and `/` as working directory
    pub fn new(executable_path: impl Into<String>) -> Self {
        let executable_path = executable_path.into();
        Self {
            argv: vec![executable_path.clone()],
            executable_path,
            environment: Vec::new(),
            working_dir: "/".to_string(),
            tty: TtyConfig::default(),
        }
    }

    pub fn with_argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((key.into(), value.into()));
        self
    }

    pub fn with_environment<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_tty(mut self, tty: TtyConfig) -> Self {
        self.tty = tty;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchResponse {
    pub child_id: ChildId,
    pub pid: i32,
    pub executable: String,
    /// A descriptor accompanies this frame
    pub pty_fd: bool,
}

/// Failure answer to a launch or wait request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitRequest {
    pub child_id: ChildId,
    /// Broker forgets the child once its status has been delivered
    pub remove_preemptively: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitResponse {
    pub child_id: ChildId,
    pub status: ExitStatus,
}

/// A child known to the broker, as reported on attach
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildReport {
    pub child_id: ChildId,
    pub pid: i32,
    pub executable: String,
    /// `None` while the child is running
    pub status: Option<ExitStatus>,
    pub pty_fd: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildTerminated {
    pub child_id: ChildId,
    pub status: ExitStatus,
}

/// Raw wait status as produced by `waitpid`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitStatus(i32);

impl ExitStatus {
    pub fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub fn from_code(code: i32) -> Self {
        Self((code & 0xff) << 8)
    }

    pub fn from_signal(signal: i32, core_dumped: bool) -> Self {
        let core = if core_dumped { 0x80 } else { 0 };
        Self((signal & 0x7f) | core)
    }

    pub fn raw(&self) -> i32 {
        self.0
    }

    /// Exit code if the child exited normally
    pub fn code(&self) -> Option<i32> {
        if self.0 & 0x7f == 0 {
            Some((self.0 >> 8) & 0xff)
        } else {
            None
        }
    }

    /// Terminating signal if the child was killed
    pub fn signal(&self) -> Option<i32> {
        match self.0 & 0x7f {
            0 => None,
            sig => Some(sig),
        }
    }

    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }
}

/// Encode a message into the wire format
///
/// Format: [4-byte length][4-byte message ID][bincode payload]
pub fn encode_message(message: &Message, message_id: MessageId) -> io::Result<Vec<u8>> {
    let payload = bincode::serialize(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    // The length field counts the message id as well.
    if payload.len() + 4 > MAX_MESSAGE_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", payload.len()),
        ));
    }
    let payload_len = payload.len() as u32;

    let mut buffer = Vec::with_capacity(8 + payload.len());
    // Length prefix covers message_id + payload
    buffer.extend_from_slice(&(payload_len + 4).to_le_bytes());
    buffer.extend_from_slice(&message_id.to_le_bytes());
    buffer.extend_from_slice(&payload);

    Ok(buffer)
}

/// Decode a message from the wire format
///
/// Returns (message, message_id)
pub fn decode_message<R: Read>(reader: &mut R) -> io::Result<(Message, MessageId)> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let payload_len = u32::from_le_bytes(len_bytes);

    if payload_len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Message length too small",
        ));
    }
    if payload_len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", payload_len),
        ));
    }

    let mut id_bytes = [0u8; 4];
    reader.read_exact(&mut id_bytes)?;
    let message_id = u32::from_le_bytes(id_bytes);

    let mut payload = vec![0u8; (payload_len - 4) as usize];
    reader.read_exact(&mut payload)?;

    let message: Message = bincode::deserialize(&payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok((message, message_id))
}

/// Write a message to a stream
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &Message,
    message_id: MessageId,
) -> io::Result<()> {
    let bytes = encode_message(message, message_id)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read a message from a stream
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<(Message, MessageId)> {
    decode_message(reader)
}

/// Write a message, attaching `fd` as `SCM_RIGHTS` to the first chunk of the frame
pub fn write_message_with_fd(
    stream: &mut UnixStream,
    message: &Message,
    message_id: MessageId,
    fd: Option<BorrowedFd<'_>>,
) -> io::Result<()> {
    let Some(fd) = fd else {
        return write_message(stream, message, message_id);
    };

    use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};

    let bytes = encode_message(message, message_id)?;
    let fds = [fd.as_raw_fd()];
    let sent = loop {
        let iov = [IoSlice::new(&bytes)];
        match sendmsg::<()>(
            stream.as_raw_fd(),
            &iov,
            &[ControlMessage::ScmRights(&fds)],
            MsgFlags::empty(),
            None,
        ) {
            Ok(n) => break n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    };

    // The descriptor went with the first byte; the rest is plain data.
    stream.write_all(&bytes[sent..])?;
    stream.flush()?;
    Ok(())
}

/// Reads frames byte-by-byte through `recvmsg`, keeping any passed descriptors
pub struct FdReader {
    stream: UnixStream,
    fds: VecDeque<OwnedFd>,
}

impl FdReader {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            fds: VecDeque::new(),
        }
    }

    /// Next descriptor received, in arrival order
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fds.pop_front()
    }

    pub fn get_ref(&self) -> &UnixStream {
        &self.stream
    }

    /// Read a frame and, when it announces one, the descriptor that came with it
    pub fn read_frame(&mut self) -> io::Result<(Message, MessageId, Option<OwnedFd>)> {
        let (message, message_id) = decode_message(self)?;
        let announces_fd = match &message {
            Message::LaunchResponse(response) => response.pty_fd,
            Message::ChildDiscovered(report) => report.pty_fd,
            _ => false,
        };
        let fd = if announces_fd {
            Some(self.take_fd().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{} announced a descriptor that never arrived", message.name()),
                )
            })?)
        } else {
            None
        };
        Ok((message, message_id, fd))
    }
}

impl Read for FdReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};

        if buf.is_empty() {
            return Ok(0);
        }

        let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS_PER_READ]);
        loop {
            let mut iov = [IoSliceMut::new(buf)];
            let received = recvmsg::<()>(
                self.stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::MSG_CMSG_CLOEXEC,
            );
            let msg = match received {
                Ok(msg) => msg,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            };

            let mut raw_fds = Vec::new();
            for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                if let ControlMessageOwned::ScmRights(received_fds) = cmsg {
                    raw_fds.extend(received_fds);
                }
            }
            let bytes = msg.bytes;

            for raw in raw_fds {
                // SAFETY: SCM_RIGHTS hands us fresh descriptors that nothing else owns.
                self.fds.push_back(unsafe { OwnedFd::from_raw_fd(raw) });
            }
            return Ok(bytes);
        }
    }
}
