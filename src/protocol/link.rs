//! Unidirectional FIFO link between two servers.
//!
//! A link holds events, not packets: each queued entry carries the time at
//! which the delivery engine may hand it over. Entries leave strictly in
//! the order they entered, whatever their receive times say. The marker
//! boundary is only meaningful because of this.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::message::{SendMessageEvent, ServerId};
use crate::sync::lock;

#[derive(Debug)]
pub struct Link {
    src: ServerId,
    dest: ServerId,
    events: Mutex<VecDeque<SendMessageEvent>>,
}

impl Link {
    pub fn new(src: ServerId, dest: ServerId) -> Self {
        Link {
            src,
            dest,
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn src(&self) -> &ServerId {
        &self.src
    }

    pub fn dest(&self) -> &ServerId {
        &self.dest
    }

    /// Append an event at the tail.
    pub fn push(&self, event: SendMessageEvent) {
        debug_assert!(event.src == self.src && event.dest == self.dest);
        lock(&self.events).push_back(event);
    }

    /// Copy of the head event, if any.
    pub fn peek(&self) -> Option<SendMessageEvent> {
        lock(&self.events).front().cloned()
    }

    /// Remove and return the head event.
    pub fn pop(&self) -> Option<SendMessageEvent> {
        lock(&self.events).pop_front()
    }

    /// Pop the head only if its receive time has arrived.
    ///
    /// A later event with an earlier receive time stays queued behind the
    /// head: delivery never overtakes on a single link.
    pub fn pop_due(&self, now: u64) -> Option<SendMessageEvent> {
        let mut events = lock(&self.events);
        match events.front() {
            Some(head) if head.receive_time <= now => events.pop_front(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.events).is_empty()
    }

    /// Sum of token amounts currently queued on this link.
    pub fn in_flight_tokens(&self) -> u64 {
        lock(&self.events)
            .iter()
            .filter_map(|e| e.message.token_amount())
            .fold(0, u64::saturating_add)
    }

    /// Copy of every queued event, head first.
    pub fn pending(&self) -> Vec<SendMessageEvent> {
        lock(&self.events).iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::Message;

    fn event(message: Message, receive_time: u64) -> SendMessageEvent {
        SendMessageEvent {
            src: "A".into(),
            dest: "B".into(),
            message,
            receive_time,
        }
    }

    #[test]
    fn test_link_fifo_order() {
        let link = Link::new("A".into(), "B".into());
        link.push(event(Message::Token { amount: 1 }, 5));
        link.push(event(Message::Marker { snapshot_id: 0 }, 2));
        link.push(event(Message::Token { amount: 2 }, 3));

        assert_eq!(link.len(), 3);
        assert_eq!(link.pop().unwrap().message, Message::Token { amount: 1 });
        assert_eq!(link.pop().unwrap().message, Message::Marker { snapshot_id: 0 });
        assert_eq!(link.pop().unwrap().message, Message::Token { amount: 2 });
        assert!(link.pop().is_none());
        assert!(link.is_empty());
    }

    #[test]
    fn test_pop_due_never_overtakes() {
        let link = Link::new("A".into(), "B".into());
        link.push(event(Message::Token { amount: 1 }, 5));
        link.push(event(Message::Token { amount: 2 }, 1));

        // The second event is due, but the head is not.
        assert!(link.pop_due(3).is_none());
        assert_eq!(link.len(), 2);

        assert_eq!(link.pop_due(5).unwrap().message, Message::Token { amount: 1 });
        assert_eq!(link.pop_due(5).unwrap().message, Message::Token { amount: 2 });
    }

    #[test]
    fn test_in_flight_tokens_ignores_markers() {
        let link = Link::new("A".into(), "B".into());
        link.push(event(Message::Token { amount: 4 }, 1));
        link.push(event(Message::Marker { snapshot_id: 9 }, 1));
        link.push(event(Message::Token { amount: 6 }, 1));

        assert_eq!(link.in_flight_tokens(), 10);
        assert_eq!(link.peek().unwrap().message, Message::Token { amount: 4 });
        assert_eq!(link.pending().len(), 3);
    }
}
