//! Tracer agent living inside the traced process
//!
//! The agent is what both backends talk to: it executes protocol
//! `Command`s against the `InstrumentationHook`, and it evaluates the small
//! `fntrace.<method>(<json args>)` call language used by injection.
//! Every reply carries the current stats mapping.

use crate::backend::TRACER_MODULE;
use crate::hook::InstrumentationHook;
use crate::protocol::{Command, CommandName, Reply};
use crate::runtime::Runtime;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors evaluating an injected expression
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("name '{0}' is not defined")]
    NameError(String),

    #[error("tracer module is not installed")]
    NotInstalled,

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("'{module}' has no method '{method}'")]
    UnknownMethod { module: String, method: String },

    #[error("bad arguments for '{method}': {reason}")]
    BadArguments { method: String, reason: String },
}

/// A parsed `module.method(args)` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub method: String,
    /// JSON array of strings, if any argument was given
    pub arguments: Option<Vec<String>>,
}

/// Parse `fntrace.method([...])`
pub fn parse_call(source: &str) -> Result<Call, EvalError> {
    let source = source.trim();

    let open = source
        .find('(')
        .ok_or_else(|| EvalError::Syntax("expected '('".to_string()))?;
    if !source.ends_with(')') {
        return Err(EvalError::Syntax("expected ')' at end".to_string()));
    }

    let target = source[..open].trim();
    let (module, method) = target
        .rsplit_once('.')
        .ok_or_else(|| EvalError::NameError(target.to_string()))?;
    if module != TRACER_MODULE {
        return Err(EvalError::NameError(module.to_string()));
    }
    if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(EvalError::Syntax(format!("invalid method name '{}'", method)));
    }

    let inner = source[open + 1..source.len() - 1].trim();
    let arguments = if inner.is_empty() {
        None
    } else {
        let names: Vec<String> =
            serde_json::from_str(inner).map_err(|e| EvalError::BadArguments {
                method: method.to_string(),
                reason: e.to_string(),
            })?;
        Some(names)
    };

    Ok(Call {
        method: method.to_string(),
        arguments,
    })
}

/// Command executor bound to one hook
#[derive(Debug)]
pub struct Agent {
    hook: Arc<InstrumentationHook>,
    installed: AtomicBool,
}

impl Agent {
    /// Agent driving `hook`
    pub fn new(hook: Arc<InstrumentationHook>) -> Self {
        Self {
            hook,
            installed: AtomicBool::new(false),
        }
    }

    /// Agent with a fresh runtime and hook, for embedding and tests
    pub fn standalone() -> Self {
        Self::new(Arc::new(InstrumentationHook::new(Arc::new(Runtime::new()))))
    }

    /// The hook this agent drives
    pub fn hook(&self) -> &Arc<InstrumentationHook> {
        &self.hook
    }

    /// True once `fntrace.install()` has been evaluated
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Execute a protocol command
    pub fn handle(&self, command: &Command) -> Reply {
        tracing::debug!(command = %command.command, "handling tracer command");

        match command.command {
            CommandName::Start => {
                let report = self.hook.enable(command.functions());
                let reply = Reply::ok(&self.hook.get_results()).with_watched(&report.watched);
                if report.failed.is_empty() {
                    reply
                } else {
                    let names: Vec<String> =
                        report.failed.iter().map(|f| f.function.to_string()).collect();
                    Reply {
                        message: Some(format!("could not resolve: {}", names.join(", "))),
                        ..reply
                    }
                }
            }
            CommandName::Update => match self.hook.update(command.functions()) {
                Ok(report) => Reply::ok(&self.hook.get_results()).with_watched(&report.watched),
                Err(error) => Reply::failed(error.to_string(), &self.hook.get_results()),
            },
            CommandName::Stop => Reply::ok(&self.hook.disable()),
            CommandName::GetResults => Reply::ok(&self.hook.get_results()),
            CommandName::Clear => {
                if self.hook.is_enabled() {
                    Reply::failed("cannot clear while tracing", &self.hook.get_results())
                } else {
                    self.hook.clear();
                    Reply::ok(&self.hook.get_results())
                }
            }
        }
    }

    /// Evaluate an injected `fntrace.*` expression
    pub fn evaluate(&self, source: &str) -> Result<serde_json::Value, EvalError> {
        let call = parse_call(source)?;

        let command = match call.method.as_str() {
            "installed" => return Ok(serde_json::Value::Bool(self.is_installed())),
            "install" => {
                self.installed.store(true, Ordering::Release);
                return Ok(serde_json::Value::Bool(true));
            }
            _ if !self.is_installed() => return Err(EvalError::NotInstalled),
            "start" => CommandName::Start,
            "update" => CommandName::Update,
            "stop" => CommandName::Stop,
            "results" => CommandName::GetResults,
            "clear" => CommandName::Clear,
            other => {
                return Err(EvalError::UnknownMethod {
                    module: TRACER_MODULE.to_string(),
                    method: other.to_string(),
                })
            }
        };

        if matches!(command, CommandName::Start | CommandName::Update) && call.arguments.is_none() {
            return Err(EvalError::BadArguments {
                method: call.method,
                reason: "expected a list of function names".to_string(),
            });
        }

        let reply = self.handle(&Command {
            command,
            arguments: call.arguments,
        });
        serde_json::to_value(reply).map_err(|e| EvalError::Syntax(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_stats_payload;
    use crate::registry::StatsMap;
    use serde_json::json;

    fn agent_with(functions: &[(&str, &str)]) -> Agent {
        let agent = Agent::standalone();
        for (module, name) in functions {
            agent.hook().runtime().symbols().define(module, name);
        }
        agent
    }

    #[test]
    fn test_parse_call_with_arguments() {
        let call = parse_call(" fntrace.start([\"a\", \"m.b\"]) ").unwrap();
        assert_eq!(call.method, "start");
        assert_eq!(call.arguments, Some(vec!["a".to_string(), "m.b".to_string()]));
    }

    #[test]
    fn test_parse_call_without_arguments() {
        let call = parse_call("fntrace.stop()").unwrap();
        assert_eq!(call.method, "stop");
        assert_eq!(call.arguments, None);
    }

    #[test]
    fn test_parse_call_errors() {
        assert!(matches!(parse_call("fntrace.stop"), Err(EvalError::Syntax(_))));
        assert!(matches!(parse_call("fntrace.stop(]"), Err(EvalError::Syntax(_))));
        assert_eq!(
            parse_call("other.stop()").unwrap_err(),
            EvalError::NameError("other".to_string())
        );
        assert!(matches!(
            parse_call("fntrace.start([1, 2])"),
            Err(EvalError::BadArguments { .. })
        ));
        assert!(matches!(parse_call("fntrace.st op()"), Err(EvalError::Syntax(_))));
        assert!(matches!(parse_call("fntrace.()"), Err(EvalError::Syntax(_))));
    }

    #[test]
    fn test_handle_start_reports_unresolved_names() {
        let agent = agent_with(&[("m", "a")]);
        let reply = agent.handle(&Command {
            command: CommandName::Start,
            arguments: Some(vec!["m.a".into(), "m.missing".into()]),
        });

        assert!(reply.success);
        assert_eq!(reply.message.as_deref(), Some("could not resolve: m.missing"));
        let stats = parse_stats_payload(&reply.results, &StatsMap::new());
        assert!(stats.contains_key("m.a"));
        assert!(!stats.contains_key("m.missing"));
        assert_eq!(reply.watched, Some(vec!["m.a".to_string()]));
    }

    #[test]
    fn test_handle_update_when_idle_fails() {
        let agent = agent_with(&[("m", "a")]);
        let reply = agent.handle(&Command {
            command: CommandName::Update,
            arguments: Some(vec!["m.a".into()]),
        });
        assert!(!reply.success);
        assert_eq!(reply.results, json!({}));
    }

    #[test]
    fn test_handle_stop_returns_final_stats() {
        let agent = agent_with(&[("m", "a")]);
        let code = agent.hook().runtime().symbols().define("m", "a");
        agent.handle(&Command {
            command: CommandName::Start,
            arguments: Some(vec!["m.a".into()]),
        });
        agent.hook().runtime().call(code, || ());

        let reply = agent.handle(&Command::new(CommandName::Stop));
        assert!(reply.success);
        assert_eq!(reply.results["m.a"]["callCount"], json!(1));
        assert!(!agent.hook().is_enabled());
    }

    #[test]
    fn test_handle_clear_only_when_idle() {
        let agent = agent_with(&[("m", "a")]);
        agent.handle(&Command {
            command: CommandName::Start,
            arguments: Some(vec!["m.a".into()]),
        });
        assert!(!agent.handle(&Command::new(CommandName::Clear)).success);

        agent.handle(&Command::new(CommandName::Stop));
        let reply = agent.handle(&Command::new(CommandName::Clear));
        assert!(reply.success);
        assert_eq!(reply.results, json!({}));
    }

    #[test]
    fn test_evaluate_requires_install() {
        let agent = agent_with(&[("m", "a")]);
        assert_eq!(agent.evaluate("fntrace.installed()").unwrap(), json!(false));
        assert_eq!(
            agent.evaluate("fntrace.results()").unwrap_err(),
            EvalError::NotInstalled
        );

        assert_eq!(agent.evaluate("fntrace.install()").unwrap(), json!(true));
        assert_eq!(agent.evaluate("fntrace.installed()").unwrap(), json!(true));
        let value = agent.evaluate("fntrace.start([\"m.a\"])").unwrap();
        assert_eq!(value["success"], json!(true));
        assert!(agent.hook().is_enabled());
    }

    #[test]
    fn test_evaluate_unknown_method() {
        let agent = Agent::standalone();
        agent.evaluate("fntrace.install()").unwrap();
        assert!(matches!(
            agent.evaluate("fntrace.explode()"),
            Err(EvalError::UnknownMethod { .. })
        ));
        assert!(matches!(
            agent.evaluate("fntrace.start()"),
            Err(EvalError::BadArguments { .. })
        ));
    }
}
