//! Request completion: callbacks and handles
//!
//! Every request into the traced process completes exactly once, with
//! either a value or a `BackendError`. `Completion` is the callback side
//! handed to a backend; `Pending` is the handle a caller can wait on.
//! A `Completion` dropped without firing reports `BackendError::Abandoned`.

use crate::backend::BackendError;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

type Callback<T> = Box<dyn FnOnce(Result<T, BackendError>) + Send>;

/// One-shot completion callback
#[must_use = "a dropped completion reports the request as abandoned"]
pub struct Completion<T: Send + 'static> {
    callback: Option<Callback<T>>,
}

impl<T: Send + 'static> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("fired", &self.callback.is_none())
            .finish()
    }
}

impl<T: Send + 'static> Completion<T> {
    /// Completion invoking `callback` with the outcome
    pub fn new(callback: impl FnOnce(Result<T, BackendError>) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// Completion with separate success and error callbacks
    pub fn from_callbacks(
        on_success: impl FnOnce(T) + Send + 'static,
        on_error: impl FnOnce(BackendError) + Send + 'static,
    ) -> Self {
        Self::new(move |result| match result {
            Ok(value) => on_success(value),
            Err(error) => on_error(error),
        })
    }

    /// Fire with a value
    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    /// Fire with an error
    pub fn fail(self, error: BackendError) {
        self.complete(Err(error));
    }

    /// Fire with an outcome
    pub fn complete(mut self, result: Result<T, BackendError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }

    /// Completion for `U` that transforms the outcome before firing `self`
    pub fn and_then<U: Send + 'static>(
        self,
        f: impl FnOnce(U) -> Result<T, BackendError> + Send + 'static,
    ) -> Completion<U> {
        Completion::new(move |result: Result<U, BackendError>| self.complete(result.and_then(f)))
    }
}

impl<T: Send + 'static> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(BackendError::Abandoned));
        }
    }
}

/// Handle resolving once its request completes
#[derive(Debug)]
pub struct Pending<T> {
    receiver: Receiver<Result<T, BackendError>>,
}

/// Linked completion/handle pair
pub fn pending<T: Send + 'static>() -> (Completion<T>, Pending<T>) {
    let (sender, receiver) = channel::bounded(1);
    let completion = Completion::new(move |result| {
        // The handle may already be gone; nobody is waiting then
        let _ = sender.send(result);
    });
    (completion, Pending { receiver })
}

impl<T: Send + 'static> Pending<T> {
    /// Already-resolved handle
    pub fn ready(value: T) -> Self {
        let (completion, handle) = pending();
        completion.succeed(value);
        handle
    }

    /// Already-failed handle
    pub fn failed(error: BackendError) -> Self {
        let (completion, handle) = pending();
        completion.fail(error);
        handle
    }

    /// Block until the request completes
    pub fn wait(self) -> Result<T, BackendError> {
        self.receiver
            .recv()
            .unwrap_or(Err(BackendError::Abandoned))
    }

    /// Block for at most `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, BackendError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(BackendError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(BackendError::Abandoned),
        }
    }

    /// The outcome, if it has arrived
    pub fn try_take(&self) -> Option<Result<T, BackendError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(BackendError::Abandoned)),
        }
    }
}
