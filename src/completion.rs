//! Single-fulfillment completion callbacks
//!
//! A [`Completion`] wraps the callback for one asynchronous operation. Fulfilling it
//! consumes it, so a completion cannot fire twice. A completion that is dropped without
//! being fulfilled (a request abandoned on an unexpected path) fires with
//! `ConnectionLost` instead of leaving the caller hanging.

use crate::error::{BrokerResult, MultiClientError};
use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

type Callback<T> = Box<dyn FnOnce(BrokerResult<T>) + Send + 'static>;

/// Callback for one asynchronous broker operation
pub struct Completion<T> {
    callback: Option<Callback<T>>,
}

impl<T> Completion<T> {
    /// Wrap a callback
    ///
    /// The callback may run on any thread.
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(BrokerResult<T>) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// Deliver the result
    pub fn complete(mut self, result: BrokerResult<T>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }

    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(self, error: MultiClientError) {
        self.complete(Err(error));
    }
}

impl<T: Send + 'static> Completion<T> {
    /// Create a completion whose result can be awaited from another thread
    pub fn channel() -> (Self, Pending<T>) {
        let (tx, rx) = mpsc::channel();
        let completion = Self::new(move |result| {
            // The receiver may have been dropped; nobody is waiting then.
            let _ = tx.send(result);
        });
        (completion, Pending { rx })
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(MultiClientError::connection_lost(
                "request abandoned before completion",
            )));
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("fulfilled", &self.callback.is_none())
            .finish()
    }
}

/// Receiving side of [`Completion::channel`]
#[derive(Debug)]
pub struct Pending<T> {
    rx: Receiver<BrokerResult<T>>,
}

impl<T> Pending<T> {
    /// Block until the completion fires
    pub fn wait(self) -> BrokerResult<T> {
        self.rx.recv().unwrap_or_else(|_| {
            Err(MultiClientError::connection_lost(
                "completion dropped without a result",
            ))
        })
    }

    /// Block for at most `timeout`; `None` if nothing arrived in time
    pub fn wait_timeout(&self, timeout: Duration) -> Option<BrokerResult<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(MultiClientError::connection_lost(
                "completion dropped without a result",
            ))),
        }
    }

    /// Non-blocking check
    pub fn try_take(&self) -> Option<BrokerResult<T>> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_succeed_delivers_value() {
        let (completion, pending) = Completion::channel();
        completion.succeed(42);
        assert_eq!(pending.wait().unwrap(), 42);
    }

    #[test]
    fn test_fail_delivers_error() {
        let (completion, pending) = Completion::<i32>::channel();
        completion.fail(MultiClientError::new(ErrorKind::CannotWait, "still running"));
        let err = pending.wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CannotWait);
    }

    #[test]
    fn test_drop_fires_connection_lost_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let completion = Completion::<()>::new(move |result| {
            assert_eq!(result.unwrap_err().kind(), ErrorKind::ConnectionLost);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        drop(completion);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_complete_does_not_refire_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let completion = Completion::new(move |result: BrokerResult<u8>| {
            assert!(result.is_ok());
            seen.fetch_add(1, Ordering::SeqCst);
        });
        completion.succeed(1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_completion_from_another_thread() {
        let (completion, pending) = Completion::channel();
        thread::spawn(move || completion.succeed("done".to_string()));
        assert_eq!(pending.wait().unwrap(), "done");
    }

    #[test]
    fn test_wait_timeout_without_result() {
        let (_completion, pending) = Completion::<i32>::channel();
        assert!(pending.wait_timeout(Duration::from_millis(20)).is_none());
        assert!(pending.try_take().is_none());
    }
}
