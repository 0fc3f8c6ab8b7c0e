//! PF/VF mailbox messaging for SR-IOV control-plane communication (§4.7).

use std::collections::{HashMap, VecDeque};

const MAX_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxOpcode {
    VfReset,
    GetStats,
    SetMtu,
    SetMacAddr,
    SetVlan,
    GetResources,
    Ack,
    Nack,
}

#[derive(Debug, Clone)]
pub struct MailboxMessage {
    pub opcode: MailboxOpcode,
    pub vf_id: u16,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl MailboxMessage {
    pub fn new(opcode: MailboxOpcode, vf_id: u16) -> Self {
        Self { opcode, vf_id, sequence: 0, payload: Vec::new() }
    }
}

pub type MessageHandler = Box<dyn FnMut(&MailboxMessage) -> MailboxMessage>;

#[derive(Debug, Default, Clone, Copy)]
pub struct MailboxStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
}

pub struct Mailbox {
    pf_handler: Option<MessageHandler>,
    vf_handlers: HashMap<u16, MessageHandler>,
    pf_inbox: VecDeque<MailboxMessage>,
    vf_inboxes: HashMap<u16, VecDeque<MailboxMessage>>,
    next_sequence: u32,
    stats: MailboxStats,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            pf_handler: None,
            vf_handlers: HashMap::new(),
            pf_inbox: VecDeque::new(),
            vf_inboxes: HashMap::new(),
            next_sequence: 1,
            stats: MailboxStats::default(),
        }
    }

    pub fn stats(&self) -> MailboxStats {
        self.stats
    }

    fn allocate_sequence(&mut self) -> u32 {
        let seq = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        seq
    }

    fn enqueue_to_vf(&mut self, msg: MailboxMessage) -> bool {
        let inbox = self.vf_inboxes.entry(msg.vf_id).or_default();
        if inbox.len() >= MAX_QUEUE_DEPTH {
            self.stats.messages_dropped += 1;
            return false;
        }
        inbox.push_back(msg);
        self.stats.messages_sent += 1;
        true
    }

    fn enqueue_to_pf(&mut self, msg: MailboxMessage) -> bool {
        if self.pf_inbox.len() >= MAX_QUEUE_DEPTH {
            self.stats.messages_dropped += 1;
            return false;
        }
        self.pf_inbox.push_back(msg);
        self.stats.messages_sent += 1;
        true
    }

    pub fn send_to_vf(&mut self, msg: MailboxMessage) -> bool {
        self.enqueue_to_vf(msg)
    }

    pub fn send_to_pf(&mut self, msg: MailboxMessage) -> bool {
        self.enqueue_to_pf(msg)
    }

    /// Returns the front message addressed to `vf_id`, matching the
    /// original's simplified single-front-slot check rather than scanning the
    /// whole queue for a matching entry.
    pub fn receive_from_vf(&mut self, vf_id: u16) -> Option<MailboxMessage> {
        let msg = self.pf_inbox.front()?;
        if msg.vf_id != vf_id {
            return None;
        }
        self.stats.messages_received += 1;
        self.pf_inbox.pop_front()
    }

    pub fn receive_from_pf(&mut self, vf_id: u16) -> Option<MailboxMessage> {
        let inbox = self.vf_inboxes.get_mut(&vf_id)?;
        let msg = inbox.pop_front()?;
        self.stats.messages_received += 1;
        Some(msg)
    }

    pub fn set_pf_handler(&mut self, handler: MessageHandler) {
        self.pf_handler = Some(handler);
    }

    pub fn set_vf_handler(&mut self, vf_id: u16, handler: MessageHandler) {
        self.vf_handlers.insert(vf_id, handler);
    }

    /// Runs each registered handler once against the front of its inbox.
    /// A response is suppressed only when it is a bare ACK with an empty
    /// payload, so a handler can signal "no reply needed" without a caller
    /// having to special-case it.
    pub fn process_pending(&mut self) {
        if let Some(handler) = &mut self.pf_handler {
            if let Some(msg) = self.pf_inbox.pop_front() {
                self.stats.messages_received += 1;
                let mut response = handler(&msg);
                if response.opcode != MailboxOpcode::Ack || !response.payload.is_empty() {
                    response.sequence = msg.sequence;
                    self.enqueue_to_vf(response);
                }
            }
        }

        let vf_ids: Vec<u16> = self.vf_handlers.keys().copied().collect();
        for vf_id in vf_ids {
            let has_message = self.vf_inboxes.get(&vf_id).is_some_and(|q| !q.is_empty());
            if !has_message {
                continue;
            }
            let msg = self.vf_inboxes.get_mut(&vf_id).unwrap().pop_front().unwrap();
            self.stats.messages_received += 1;
            let mut response = self.vf_handlers.get_mut(&vf_id).unwrap()(&msg);
            if response.opcode != MailboxOpcode::Ack || !response.payload.is_empty() {
                response.sequence = msg.sequence;
                self.enqueue_to_pf(response);
            }
        }
    }

    /// Synchronous request/response helper. Rather than blocking the thread
    /// (the original sleeps in 1ms increments), this cooperatively yields to
    /// `pump` once per iteration, letting the caller drive `process_pending`
    /// and any other scheduling between attempts. Gives up after
    /// `max_iterations` without a matching-sequence reply.
    pub fn send_and_receive(
        &mut self,
        mut msg: MailboxMessage,
        max_iterations: u32,
        mut pump: impl FnMut(&mut Mailbox),
    ) -> Option<MailboxMessage> {
        msg.sequence = self.allocate_sequence();
        let request_sequence = msg.sequence;
        let vf_id = msg.vf_id;

        let sent = if vf_id == 0 { self.send_to_pf(msg) } else { self.send_to_vf(msg) };
        if !sent {
            return None;
        }

        for _ in 0..max_iterations {
            let response =
                if vf_id == 0 { self.receive_from_pf(vf_id) } else { self.receive_from_vf(vf_id) };
            if let Some(response) = response {
                if response.sequence == request_sequence {
                    return Some(response);
                }
            }
            pump(self);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_depth_is_bounded_and_counts_drops() {
        let mut mbox = Mailbox::new();
        for _ in 0..MAX_QUEUE_DEPTH {
            assert!(mbox.send_to_vf(MailboxMessage::new(MailboxOpcode::GetStats, 3)));
        }
        assert!(!mbox.send_to_vf(MailboxMessage::new(MailboxOpcode::GetStats, 3)));
        assert_eq!(mbox.stats().messages_dropped, 1);
    }

    #[test]
    fn process_pending_suppresses_bare_ack() {
        let mut mbox = Mailbox::new();
        mbox.set_vf_handler(
            1,
            Box::new(|_msg| MailboxMessage::new(MailboxOpcode::Ack, 1)),
        );
        mbox.send_to_pf(MailboxMessage::new(MailboxOpcode::SetMtu, 1));
        mbox.process_pending();
        assert!(mbox.receive_from_vf(1).is_none());
    }

    #[test]
    fn process_pending_forwards_non_ack_response() {
        let mut mbox = Mailbox::new();
        mbox.set_vf_handler(
            1,
            Box::new(|_msg| {
                let mut m = MailboxMessage::new(MailboxOpcode::GetStats, 1);
                m.payload = vec![1, 2, 3];
                m
            }),
        );
        mbox.send_to_pf(MailboxMessage::new(MailboxOpcode::GetStats, 1));
        mbox.process_pending();
        let response = mbox.receive_from_vf(1).unwrap();
        assert_eq!(response.payload, vec![1, 2, 3]);
    }

    #[test]
    fn send_and_receive_matches_on_sequence() {
        let mut mbox = Mailbox::new();
        mbox.set_pf_handler(Box::new(|msg| {
            let mut resp = MailboxMessage::new(MailboxOpcode::GetStats, 0);
            resp.payload = vec![msg.vf_id as u8];
            resp
        }));
        let response = mbox.send_and_receive(
            MailboxMessage::new(MailboxOpcode::GetStats, 0),
            10,
            |m| m.process_pending(),
        );
        assert!(response.is_some());
    }

    #[test]
    fn send_and_receive_times_out_without_handler() {
        let mut mbox = Mailbox::new();
        let response = mbox.send_and_receive(
            MailboxMessage::new(MailboxOpcode::GetStats, 0),
            5,
            |_| {},
        );
        assert!(response.is_none());
    }
}
