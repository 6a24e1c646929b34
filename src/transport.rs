//! In-process channels to an `Agent`
//!
//! These stand in for a debugger connection when the controller and the
//! traced code share a process:
//!
//! - `LocalTransport` / `LocalEvaluator` complete requests inline.
//! - `ThreadedTransport` hands requests to a dedicated agent thread through
//!   a bounded queue, so completions arrive from that thread, the way a
//!   remote reply would.
//!
//! `LocalAttachment` bundles whichever of them is currently attached.

use crate::agent::Agent;
use crate::backend::{Attachment, BackendError, Evaluator, Transport};
use crate::pending::Completion;
use crate::protocol::{Command, Reply};
use crossbeam::channel::{self, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

/// Protocol channel answering inline
#[derive(Debug)]
pub struct LocalTransport {
    agent: Arc<Agent>,
    connected: AtomicBool,
}

impl LocalTransport {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self {
            agent,
            connected: AtomicBool::new(true),
        }
    }

    /// Simulate losing the connection
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

impl Transport for LocalTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn request(&self, command: Command, done: Completion<Reply>) {
        if !self.is_connected() {
            done.fail(BackendError::Transport("not connected".to_string()));
            return;
        }
        done.succeed(self.agent.handle(&command));
    }
}

/// Expression evaluator answering inline
#[derive(Debug)]
pub struct LocalEvaluator {
    agent: Arc<Agent>,
    connected: AtomicBool,
}

impl LocalEvaluator {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self {
            agent,
            connected: AtomicBool::new(true),
        }
    }

    /// Simulate losing the connection
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

impl Evaluator for LocalEvaluator {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn evaluate(&self, source: String, done: Completion<serde_json::Value>) {
        if !self.is_connected() {
            done.fail(BackendError::Transport("not connected".to_string()));
            return;
        }
        done.complete(
            self.agent
                .evaluate(&source)
                .map_err(|e| BackendError::Evaluation(e.to_string())),
        );
    }
}

type Request = (Command, Completion<Reply>);

/// Protocol channel served by a dedicated agent thread
pub struct ThreadedTransport {
    sender: Option<Sender<Request>>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ThreadedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedTransport")
            .field("connected", &self.sender.is_some())
            .finish()
    }
}

impl ThreadedTransport {
    /// Start the agent thread with a request queue of `capacity`
    pub fn spawn(agent: Arc<Agent>, capacity: usize) -> std::io::Result<Self> {
        let (sender, receiver) = channel::bounded::<Request>(capacity.max(1));
        let worker = thread::Builder::new()
            .name("fntrace-agent".to_string())
            .spawn(move || {
                for (command, done) in receiver {
                    done.succeed(agent.handle(&command));
                }
                tracing::debug!("agent thread exiting");
            })?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Stop accepting requests and wait for queued ones to finish
    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("agent thread panicked");
            }
        }
    }
}

impl Transport for ThreadedTransport {
    fn is_connected(&self) -> bool {
        self.sender.is_some()
    }

    fn request(&self, command: Command, done: Completion<Reply>) {
        let Some(sender) = &self.sender else {
            done.fail(BackendError::Transport("agent thread stopped".to_string()));
            return;
        };
        match sender.try_send((command, done)) {
            Ok(()) => {}
            Err(TrySendError::Full((_, done))) => {
                done.fail(BackendError::Transport("request queue full".to_string()));
            }
            Err(TrySendError::Disconnected((_, done))) => {
                done.fail(BackendError::Transport("agent thread stopped".to_string()));
            }
        }
    }
}

impl Drop for ThreadedTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The channels available for the current attach
#[derive(Default)]
pub struct LocalAttachment {
    transport: Mutex<Option<Arc<dyn Transport>>>,
    evaluator: Mutex<Option<Arc<dyn Evaluator>>>,
}

impl LocalAttachment {
    /// Nothing attached
    pub fn detached() -> Self {
        Self::default()
    }

    /// Only the protocol channel
    pub fn protocol(agent: Arc<Agent>) -> Self {
        let attachment = Self::detached();
        attachment.attach_transport(Arc::new(LocalTransport::new(agent)));
        attachment
    }

    /// Only the evaluation channel
    pub fn injection(agent: Arc<Agent>) -> Self {
        let attachment = Self::detached();
        attachment.attach_evaluator(Arc::new(LocalEvaluator::new(agent)));
        attachment
    }

    /// Both channels to the same agent
    pub fn both(agent: Arc<Agent>) -> Self {
        let attachment = Self::protocol(Arc::clone(&agent));
        attachment.attach_evaluator(Arc::new(LocalEvaluator::new(agent)));
        attachment
    }

    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.lock().unwrap_or_else(PoisonError::into_inner) = Some(transport);
    }

    pub fn attach_evaluator(&self, evaluator: Arc<dyn Evaluator>) {
        *self.evaluator.lock().unwrap_or_else(PoisonError::into_inner) = Some(evaluator);
    }

    pub fn detach_transport(&self) {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn detach_evaluator(&self) {
        self.evaluator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Attachment for LocalAttachment {
    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn evaluator(&self) -> Option<Arc<dyn Evaluator>> {
        self.evaluator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
