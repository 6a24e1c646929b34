//! Wire commands and replies exchanged with the traced process
//!
//! Commands carry a name and, for start/update, the function-name list.
//! Replies carry a mapping from function name to the four numeric fields
//! of `FunctionStats`.

use crate::identity::FunctionId;
use crate::registry::StatsMap;
use crate::stats::FunctionStats;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Operations the traced process understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandName {
    #[serde(rename = "functionTracer_start")]
    Start,
    #[serde(rename = "functionTracer_update")]
    Update,
    #[serde(rename = "functionTracer_stop")]
    Stop,
    #[serde(rename = "functionTracer_getResults")]
    GetResults,
    #[serde(rename = "functionTracer_clear")]
    Clear,
}

impl CommandName {
    /// Wire name of the command
    pub fn as_str(self) -> &'static str {
        match self {
            CommandName::Start => "functionTracer_start",
            CommandName::Update => "functionTracer_update",
            CommandName::Stop => "functionTracer_stop",
            CommandName::GetResults => "functionTracer_getResults",
            CommandName::Clear => "functionTracer_clear",
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request sent into the traced process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub command: CommandName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<String>>,
}

impl Command {
    /// Command without arguments
    pub fn new(command: CommandName) -> Self {
        Self {
            command,
            arguments: None,
        }
    }

    /// Command carrying a function list
    pub fn with_functions<'a>(
        command: CommandName,
        functions: impl IntoIterator<Item = &'a FunctionId>,
    ) -> Self {
        Self {
            command,
            arguments: Some(functions.into_iter().map(|f| f.to_string()).collect()),
        }
    }

    /// The function list as identities (empty if absent)
    pub fn functions(&self) -> Vec<FunctionId> {
        self.arguments
            .iter()
            .flatten()
            .map(|name| FunctionId::new(name))
            .collect()
    }
}

/// The traced process's answer to a `Command`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// function name → stats object; left untyped so one bad entry cannot
    /// spoil the rest
    #[serde(default)]
    pub results: serde_json::Value,
    /// Functions actually watched after a start/update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watched: Option<Vec<String>>,
}

impl Reply {
    /// Successful reply carrying `stats`
    pub fn ok(stats: &StatsMap) -> Self {
        Self {
            success: true,
            message: None,
            results: stats_payload(stats),
            watched: None,
        }
    }

    /// Failed reply carrying the current `stats`
    pub fn failed(message: impl Into<String>, stats: &StatsMap) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            results: stats_payload(stats),
            watched: None,
        }
    }

    /// Attach the watch set the traced process ended up with
    pub fn with_watched(mut self, watched: &BTreeSet<FunctionId>) -> Self {
        self.watched = Some(watched.iter().map(|f| f.to_string()).collect());
        self
    }

    /// The confirmed watch set, if the reply carries one
    pub fn watched_functions(&self) -> Option<BTreeSet<FunctionId>> {
        self.watched
            .as_ref()
            .map(|names| names.iter().map(FunctionId::new).collect())
    }
}

/// Encode a stats mapping as a JSON object
pub fn stats_payload(stats: &StatsMap) -> serde_json::Value {
    let object = stats
        .iter()
        .map(|(function, stats)| {
            let value = serde_json::to_value(stats).unwrap_or(serde_json::Value::Null);
            (function.to_string(), value)
        })
        .collect();
    serde_json::Value::Object(object)
}

/// Apply a stats payload on top of `prior`
///
/// Unknown functions start from a zeroed record. Only numeric fields are
/// applied; bad fields and bad entries are logged and skipped, and a
/// payload that is not an object leaves `prior` untouched.
pub fn parse_stats_payload(payload: &serde_json::Value, prior: &StatsMap) -> StatsMap {
    let mut merged = prior.clone();

    let Some(entries) = payload.as_object() else {
        if !payload.is_null() {
            tracing::warn!(payload = %payload, "stats payload is not an object, ignoring");
        }
        return merged;
    };

    for (name, value) in entries {
        let function = FunctionId::new(name);
        let record = merged.entry(function).or_insert_with(FunctionStats::new);
        let rejected = record.merge_reply_fields(value);
        if !rejected.is_empty() {
            tracing::warn!(function = %name, fields = ?rejected, "ignoring malformed stats fields");
        }
    }

    merged
}
