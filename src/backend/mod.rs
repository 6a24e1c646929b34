//! Tracer backends
//!
//! A backend is a strategy for reaching the instrumentation inside the
//! traced process. Two exist:
//!
//! - `ProtocolBackend` speaks the command protocol to a runtime that
//!   already carries the tracer.
//! - `InjectionBackend` deploys the tracer through an expression-evaluation
//!   channel and drives it by evaluating calls.
//!
//! Which one is usable depends on what the current attachment offers, and
//! that can change between calls, so `detect` runs once per operation.

mod injection;
mod protocol;

pub use injection::{InjectionBackend, TRACER_MODULE};
pub use protocol::ProtocolBackend;

use crate::identity::FunctionId;
use crate::pending::Completion;
use crate::protocol::{Command, CommandName, Reply};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors reaching or talking to the traced process
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("no tracer backend available for this attachment")]
    Unavailable,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("malformed reply: {0}")]
    Malformed(String),

    #[error("request abandoned before completion")]
    Abandoned,

    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

/// Concrete backend implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Protocol,
    Injection,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Protocol => f.write_str("protocol"),
            BackendKind::Injection => f.write_str("injection"),
        }
    }
}

/// Which backend the controller may use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Protocol if available, otherwise injection
    #[default]
    Auto,
    /// Protocol only
    Protocol,
    /// Injection only
    Injection,
}

/// Command channel to a runtime that already hosts the tracer
pub trait Transport: Send + Sync {
    /// True while the channel can carry requests
    fn is_connected(&self) -> bool;

    /// True if the remote side handles `command`
    fn supports(&self, _command: CommandName) -> bool {
        true
    }

    /// Send `command`; `done` fires with the reply or the failure
    fn request(&self, command: Command, done: Completion<Reply>);
}

/// Expression-evaluation channel into the traced process
pub trait Evaluator: Send + Sync {
    /// True while expressions can be evaluated
    fn is_connected(&self) -> bool;

    /// Evaluate `source`; `done` fires with the JSON result
    fn evaluate(&self, source: String, done: Completion<serde_json::Value>);
}

/// What the current attach offers
pub trait Attachment: Send + Sync {
    fn transport(&self) -> Option<Arc<dyn Transport>>;
    fn evaluator(&self) -> Option<Arc<dyn Evaluator>>;
}

/// The four tracer operations plus `clear`, routed to the traced process
///
/// Each operation completes exactly once. A reply with `success == false`
/// completes with `BackendError::Rejected`.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;
    fn start(&self, functions: &[FunctionId], done: Completion<Reply>);
    fn update(&self, functions: &[FunctionId], done: Completion<Reply>);
    fn stop(&self, done: Completion<Reply>);
    fn get_results(&self, done: Completion<Reply>);
    fn clear(&self, done: Completion<Reply>);
}

/// Pick the backend for one operation
pub fn detect(attachment: &dyn Attachment, preference: BackendPreference) -> Option<Box<dyn Backend>> {
    let protocol = || {
        attachment
            .transport()
            .filter(|t| t.is_connected() && t.supports(CommandName::Start))
            .map(|t| Box::new(ProtocolBackend::new(t)) as Box<dyn Backend>)
    };
    let injection = || {
        attachment
            .evaluator()
            .filter(|e| e.is_connected())
            .map(|e| Box::new(InjectionBackend::new(e)) as Box<dyn Backend>)
    };

    let backend = match preference {
        BackendPreference::Auto => protocol().or_else(injection),
        BackendPreference::Protocol => protocol(),
        BackendPreference::Injection => injection(),
    };

    match &backend {
        Some(backend) => tracing::debug!(kind = %backend.kind(), "selected tracer backend"),
        None => tracing::debug!(?preference, "no tracer backend available"),
    }
    backend
}

/// Turn a reply into an error if the traced process refused the request
fn accept_reply(reply: Reply) -> Result<Reply, BackendError> {
    if reply.success {
        Ok(reply)
    } else {
        Err(BackendError::Rejected(
            reply.message.unwrap_or_else(|| "unspecified failure".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::transport::LocalAttachment;

    #[test]
    fn test_detect_nothing_attached() {
        let attachment = LocalAttachment::detached();
        assert!(detect(&attachment, BackendPreference::Auto).is_none());
    }

    #[test]
    fn test_detect_prefers_protocol() {
        let agent = Arc::new(Agent::standalone());
        let attachment = LocalAttachment::both(agent);
        let backend = detect(&attachment, BackendPreference::Auto).unwrap();
        assert_eq!(backend.kind(), BackendKind::Protocol);
    }

    #[test]
    fn test_detect_falls_back_to_injection() {
        let agent = Arc::new(Agent::standalone());
        let attachment = LocalAttachment::injection(agent);
        let backend = detect(&attachment, BackendPreference::Auto).unwrap();
        assert_eq!(backend.kind(), BackendKind::Injection);
    }

    #[test]
    fn test_detect_honours_preference() {
        let agent = Arc::new(Agent::standalone());
        let attachment = LocalAttachment::protocol(agent);
        assert!(detect(&attachment, BackendPreference::Injection).is_none());
        assert!(detect(&attachment, BackendPreference::Protocol).is_some());
    }

    #[test]
    fn test_detect_skips_disconnected_transport() {
        let agent = Arc::new(Agent::standalone());
        let attachment = LocalAttachment::both(agent);
        attachment.detach_transport();
        let backend = detect(&attachment, BackendPreference::Auto).unwrap();
        assert_eq!(backend.kind(), BackendKind::Injection);
    }

    #[test]
    fn test_accept_reply() {
        let stats = crate::registry::StatsMap::new();
        assert!(accept_reply(Reply::ok(&stats)).is_ok());
        assert_eq!(
            accept_reply(Reply::failed("nope", &stats)).unwrap_err(),
            BackendError::Rejected("nope".to_string())
        );
    }

    #[test]
    fn test_preference_parses_lowercase() {
        let pref: BackendPreference = serde_json::from_str("\"injection\"").unwrap();
        assert_eq!(pref, BackendPreference::Injection);
        assert_eq!(BackendPreference::default(), BackendPreference::Auto);
    }
}
