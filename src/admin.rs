//! Firmware-style admin command/completion queue for out-of-band control
//! (§4.7).

use std::collections::VecDeque;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOpcode {
    GetStats,
    ResetStats,
    SetFeature,
    GetFeature,
    InjectError,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    InvalidOpcode,
    InvalidParameter,
    NotSupported,
    InternalError,
}

#[derive(Debug, Clone, Copy)]
pub struct AdminCommand {
    pub opcode: AdminOpcode,
    pub flags: u16,
    pub namespace_id: u32,
    pub data: [u32; 4],
}

#[derive(Debug, Clone, Copy)]
pub struct AdminCompletion {
    pub result: u32,
    pub status: StatusCode,
    pub command_id: u16,
}

pub type CommandHandler = Box<dyn FnMut(&AdminCommand, u16) -> AdminCompletion>;

const MAX_COMMANDS_PER_TICK: usize = 16;

struct PendingCommand {
    cmd: AdminCommand,
    command_id: u16,
}

pub struct AdminQueue {
    pending: VecDeque<PendingCommand>,
    completions: VecDeque<AdminCompletion>,
    next_command_id: u16,
    handler: Option<CommandHandler>,
}

impl Default for AdminQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AdminQueue {
    pub fn new() -> Self {
        Self { pending: VecDeque::new(), completions: VecDeque::new(), next_command_id: 0, handler: None }
    }

    pub fn register_handler(&mut self, handler: CommandHandler) {
        self.handler = Some(handler);
    }

    pub fn submit_command(&mut self, cmd: AdminCommand) -> u16 {
        let command_id = self.next_command_id;
        self.next_command_id = self.next_command_id.wrapping_add(1);
        debug!(command_id, opcode = ?cmd.opcode, "admin cmd submitted");
        self.pending.push_back(PendingCommand { cmd, command_id });
        command_id
    }

    pub fn poll_completion(&mut self) -> Option<AdminCompletion> {
        self.completions.pop_front()
    }

    /// Processes up to 16 commands per call to avoid starving other work.
    pub fn process_commands(&mut self) {
        let mut processed = 0;
        while processed < MAX_COMMANDS_PER_TICK {
            let Some(pending) = self.pending.pop_front() else { break };

            let comp = match &mut self.handler {
                Some(handler) => handler(&pending.cmd, pending.command_id),
                None => AdminCompletion {
                    result: 0,
                    status: StatusCode::NotSupported,
                    command_id: pending.command_id,
                },
            };

            debug!(command_id = comp.command_id, status = ?comp.status, "admin cmd completed");
            self.completions.push_back(comp);
            processed += 1;
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn completion_count(&self) -> usize {
        self.completions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unhandled_command_completes_not_supported() {
        let mut queue = AdminQueue::new();
        let id = queue.submit_command(AdminCommand {
            opcode: AdminOpcode::GetStats,
            flags: 0,
            namespace_id: 0,
            data: [0; 4],
        });
        queue.process_commands();
        let comp = queue.poll_completion().unwrap();
        assert_eq!(comp.command_id, id);
        assert_eq!(comp.status, StatusCode::NotSupported);
    }

    #[test]
    fn handler_echoes_command_id() {
        let mut queue = AdminQueue::new();
        queue.register_handler(Box::new(|cmd, command_id| AdminCompletion {
            result: cmd.namespace_id,
            status: StatusCode::Success,
            command_id,
        }));
        let id = queue.submit_command(AdminCommand {
            opcode: AdminOpcode::SetFeature,
            flags: 0,
            namespace_id: 42,
            data: [0; 4],
        });
        queue.process_commands();
        let comp = queue.poll_completion().unwrap();
        assert_eq!(comp.command_id, id);
        assert_eq!(comp.result, 42);
        assert_eq!(comp.status, StatusCode::Success);
    }

    #[test]
    fn processing_caps_at_sixteen_per_tick() {
        let mut queue = AdminQueue::new();
        queue.register_handler(Box::new(|_, command_id| AdminCompletion {
            result: 0,
            status: StatusCode::Success,
            command_id,
        }));
        for _ in 0..20 {
            queue.submit_command(AdminCommand {
                opcode: AdminOpcode::GetStats,
                flags: 0,
                namespace_id: 0,
                data: [0; 4],
            });
        }
        queue.process_commands();
        assert_eq!(queue.completion_count(), 16);
        assert_eq!(queue.pending_count(), 4);
    }
}
