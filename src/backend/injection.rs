//! Backend that deploys the tracer through expression evaluation
//!
//! Each operation first asks whether the tracer module is present in the
//! traced process, deploys it when it is not, then evaluates the call.
//! The evaluated call returns a serialized `Reply`.

use super::{accept_reply, Backend, BackendError, BackendKind, Evaluator};
use crate::identity::FunctionId;
use crate::pending::Completion;
use crate::protocol::Reply;
use std::sync::Arc;

/// Name under which the tracer module is reachable in the traced process
pub const TRACER_MODULE: &str = "fntrace";

/// Drives the tracer by evaluating `fntrace.<op>(...)` expressions
pub struct InjectionBackend {
    evaluator: Arc<dyn Evaluator>,
}

impl InjectionBackend {
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self { evaluator }
    }

    /// Expression calling `method` with an optional function list
    pub fn expression(method: &str, functions: Option<&[FunctionId]>) -> String {
        let arguments = functions
            .map(|functions| {
                let names: Vec<&str> = functions.iter().map(FunctionId::as_str).collect();
                serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string())
            })
            .unwrap_or_default();
        format!("{}.{}({})", TRACER_MODULE, method, arguments)
    }

    fn run(&self, call: String, done: Completion<Reply>) {
        let evaluator = Arc::clone(&self.evaluator);
        self.evaluator.evaluate(
            Self::expression("installed", None),
            Completion::new(move |present| match present {
                Ok(serde_json::Value::Bool(true)) => evaluate_call(&evaluator, call, done),
                Ok(_) | Err(_) => install_then_call(evaluator, call, done),
            }),
        );
    }
}

fn install_then_call(evaluator: Arc<dyn Evaluator>, call: String, done: Completion<Reply>) {
    let next = Arc::clone(&evaluator);
    evaluator.evaluate(
        InjectionBackend::expression("install", None),
        Completion::new(move |installed| match installed {
            Ok(_) => {
                tracing::info!(module = TRACER_MODULE, "deployed tracer into traced process");
                evaluate_call(&next, call, done);
            }
            Err(error) => {
                tracing::warn!(%error, "could not deploy tracer");
                done.fail(error);
            }
        }),
    );
}

fn evaluate_call(evaluator: &Arc<dyn Evaluator>, call: String, done: Completion<Reply>) {
    tracing::debug!(expression = %call, "evaluating tracer call");
    evaluator.evaluate(
        call,
        done.and_then(|value| accept_reply(decode_reply(value)?)),
    );
}

/// Read an evaluation result as a `Reply`
///
/// Tracer modules that return the bare stats mapping instead of the full
/// envelope are read as a successful reply carrying that mapping.
fn decode_reply(value: serde_json::Value) -> Result<Reply, BackendError> {
    let bare = value
        .as_object()
        .is_some_and(|fields| !fields.contains_key("success"));
    if bare {
        tracing::debug!("tracer call returned a bare stats mapping");
        return Ok(Reply {
            success: true,
            message: None,
            results: value,
            watched: None,
        });
    }
    serde_json::from_value(value).map_err(|e| BackendError::Malformed(e.to_string()))
}

impl Backend for InjectionBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Injection
    }

    fn start(&self, functions: &[FunctionId], done: Completion<Reply>) {
        self.run(Self::expression("start", Some(functions)), done);
    }

    fn update(&self, functions: &[FunctionId], done: Completion<Reply>) {
        self.run(Self::expression("update", Some(functions)), done);
    }

    fn stop(&self, done: Completion<Reply>) {
        self.run(Self::expression("stop", None), done);
    }

    fn get_results(&self, done: Completion<Reply>) {
        self.run(Self::expression("results", None), done);
    }

    fn clear(&self, done: Completion<Reply>) {
        self.run(Self::expression("clear", None), done);
    }
}
