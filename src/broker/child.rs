//! Children launched through (or discovered on) a broker connection

use crate::broker::client::Shared;
use crate::broker::protocol::{ChildId, ExitStatus};
use crate::completion::Completion;
use crate::error::MultiClientError;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Liveness of a child as seen by its handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Running,
    Terminated(ExitStatus),
    /// The connection that knew about this child was lost
    Unknown,
}

impl ChildState {
    pub fn as_str(&self) -> &str {
        match self {
            ChildState::Running => "Running",
            ChildState::Terminated(_) => "Terminated",
            ChildState::Unknown => "Unknown",
        }
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            ChildState::Terminated(status) => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct ChildStatus {
    pub(crate) state: ChildState,
    /// A wait delivered the terminal status; later waits are answered locally
    pub(crate) waited: bool,
    pub(crate) preemptive_wait_in_flight: bool,
    /// The broker agreed to forget this child once it terminates
    pub(crate) removal_requested: bool,
}

struct ChildInner {
    id: ChildId,
    pid: i32,
    executable: String,
    status: Mutex<ChildStatus>,
    pty: Mutex<Option<OwnedFd>>,
    owner: Weak<Shared>,
}

/// A process owned by the broker
///
/// Cloning yields another reference to the same child. Equality is by child id.
#[derive(Clone)]
pub struct Child {
    inner: Arc<ChildInner>,
}

impl Child {
    pub(crate) fn new(
        id: ChildId,
        pid: i32,
        executable: String,
        state: ChildState,
        pty: Option<OwnedFd>,
        owner: Weak<Shared>,
    ) -> Self {
        Self {
            inner: Arc::new(ChildInner {
                id,
                pid,
                executable,
                status: Mutex::new(ChildStatus {
                    state,
                    waited: false,
                    preemptive_wait_in_flight: false,
                    removal_requested: false,
                }),
                pty: Mutex::new(pty),
                owner,
            }),
        }
    }

    /// Broker-assigned id
    pub fn id(&self) -> ChildId {
        self.inner.id
    }

    pub fn pid(&self) -> i32 {
        self.inner.pid
    }

    pub fn executable(&self) -> &str {
        &self.inner.executable
    }

    pub fn state(&self) -> ChildState {
        self.status().state
    }

    /// Terminal status, once known
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status().state.exit_status()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ChildState::Running
    }

    /// Whether a wait has already delivered this child's status
    pub fn has_waited(&self) -> bool {
        self.status().waited
    }

    /// Take ownership of the pty master descriptor
    ///
    /// Returns `None` after the first call, or if the broker sent no descriptor.
    pub fn take_pty_fd(&self) -> Option<OwnedFd> {
        self.inner
            .pty
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Ask the owning handle for this child's termination status
    ///
    /// See [`MultiClient::wait_for_child`](crate::broker::MultiClient::wait_for_child).
    pub fn wait(&self, remove_preemptively: bool, completion: Completion<ExitStatus>) {
        match self.inner.owner.upgrade() {
            Some(shared) => shared.wait_for_child(self, remove_preemptively, completion),
            None => completion.fail(MultiClientError::connection_lost(
                "the handle that owned this child is gone",
            )),
        }
    }

    pub(crate) fn status(&self) -> MutexGuard<'_, ChildStatus> {
        self.inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_owned_by(&self, shared: &Arc<Shared>) -> bool {
        std::ptr::eq(self.inner.owner.as_ptr(), Arc::as_ptr(shared))
    }

    /// A wait response arrived
    pub(crate) fn record_waited(&self, status: ExitStatus) {
        let mut st = self.status();
        st.state = ChildState::Terminated(status);
        st.waited = true;
        st.preemptive_wait_in_flight = false;
    }

    /// The broker reported termination without being asked
    pub(crate) fn record_terminated(&self, status: ExitStatus) {
        let mut st = self.status();
        st.state = ChildState::Terminated(status);
        if st.removal_requested {
            // The broker already forgot it, so this status is the only one we will get.
            st.waited = true;
        }
    }

    /// The connection died; a child we thought was running is now in limbo
    pub(crate) fn mark_unknown(&self) {
        let mut st = self.status();
        if st.state == ChildState::Running {
            st.state = ChildState::Unknown;
        }
        st.preemptive_wait_in_flight = false;
    }
}

impl PartialEq for Child {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Child {}

impl Hash for Child {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Child {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Child")
            .field("id", &self.inner.id)
            .field("pid", &self.inner.pid)
            .field("executable", &self.inner.executable)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn orphan(id: ChildId, pid: i32) -> Child {
        Child::new(id, pid, "/bin/sh".to_string(), ChildState::Running, None, Weak::new())
    }

    #[test]
    fn test_equality_is_by_id() {
        let a = orphan(1, 100);
        let b = orphan(1, 200);
        let c = orphan(2, 100);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: std::collections::HashSet<Child> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_terminated_notification_does_not_count_as_waited() {
        let child = orphan(1, 100);
        child.record_terminated(ExitStatus::from_code(2));
        assert_eq!(child.state(), ChildState::Terminated(ExitStatus::from_code(2)));
        assert!(!child.has_waited());
    }

    #[test]
    fn test_termination_after_preemptive_removal_is_final() {
        let child = orphan(1, 100);
        child.status().removal_requested = true;
        child.record_terminated(ExitStatus::from_code(0));
        assert!(child.has_waited());
    }

    #[test]
    fn test_mark_unknown_only_affects_running() {
        let running = orphan(1, 100);
        running.mark_unknown();
        assert_eq!(running.state(), ChildState::Unknown);

        let done = orphan(2, 101);
        done.record_waited(ExitStatus::from_code(0));
        done.mark_unknown();
        assert_eq!(done.exit_status(), Some(ExitStatus::from_code(0)));
    }

    #[test]
    fn test_wait_without_owner_fails() {
        let child = orphan(1, 100);
        let (completion, pending) = Completion::channel();
        child.wait(false, completion);
        assert_eq!(pending.wait().unwrap_err().kind(), ErrorKind::ConnectionLost);
    }

    #[test]
    fn test_take_pty_fd_once() {
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        let child = Child::new(
            1,
            100,
            "/bin/sh".to_string(),
            ChildState::Running,
            Some(read_end),
            Weak::new(),
        );
        assert!(child.take_pty_fd().is_some());
        assert!(child.take_pty_fd().is_none());
    }
}
