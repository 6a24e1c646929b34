//! Backend speaking the command protocol

use super::{accept_reply, Backend, BackendKind, Transport};
use crate::identity::FunctionId;
use crate::pending::Completion;
use crate::protocol::{Command, CommandName, Reply};
use std::sync::Arc;

/// Sends `Command`s over a `Transport` to an already-instrumented runtime
pub struct ProtocolBackend {
    transport: Arc<dyn Transport>,
}

impl ProtocolBackend {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    fn send(&self, command: Command, done: Completion<Reply>) {
        tracing::debug!(command = %command.command, "sending tracer command");
        self.transport.request(command, done.and_then(accept_reply));
    }
}

impl Backend for ProtocolBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Protocol
    }

    fn start(&self, functions: &[FunctionId], done: Completion<Reply>) {
        self.send(Command::with_functions(CommandName::Start, functions), done);
    }

    fn update(&self, functions: &[FunctionId], done: Completion<Reply>) {
        self.send(Command::with_functions(CommandName::Update, functions), done);
    }

    fn stop(&self, done: Completion<Reply>) {
        self.send(Command::new(CommandName::Stop), done);
    }

    fn get_results(&self, done: Completion<Reply>) {
        self.send(Command::new(CommandName::GetResults), done);
    }

    fn clear(&self, done: Completion<Reply>) {
        self.send(Command::new(CommandName::Clear), done);
    }
}
