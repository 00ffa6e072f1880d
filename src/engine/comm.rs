//! Lifecycle messages and the shared engine/observer channel
//!
//! A [`CommChannel`] carries two kinds of traffic: lifecycle [`Message`]s
//! flowing from the engine to any number of subscribed observers, and a
//! termination-request flag flowing from observers back to the engine. The
//! flag is the only piece of state that crosses threads into the engine; it
//! is polled from inside the Lua execution hook.

use chrono::{DateTime, Utc};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Kind of lifecycle event flowing on a [`CommChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// A sequence driver started traversing a sequence
    SequenceStarted,
    /// A sequence finished without error
    SequenceStopped,
    /// A sequence finished with an error
    SequenceStoppedWithError,
    /// A step began executing its script
    StepStarted,
    /// A step finished without error
    StepStopped,
    /// A step finished with an error
    StepStoppedWithError,
}

/// A lifecycle event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Event kind
    pub msg_type: MessageType,

    /// Human-readable event text
    pub text: String,

    /// When the event occurred
    pub timestamp: DateTime<Utc>,

    /// Index of the step this event refers to
    pub step_index: u64,
}

impl Message {
    /// Create a new message.
    pub fn new(
        msg_type: MessageType,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
        step_index: u64,
    ) -> Self {
        Self {
            msg_type,
            text: text.into(),
            timestamp,
            step_index,
        }
    }
}

/// Shared channel between the engine thread and observer threads.
///
/// Observers call [`subscribe()`](CommChannel::subscribe) to receive lifecycle
/// messages in FIFO order and [`request_termination()`](CommChannel::request_termination)
/// to ask the engine to abort the running script. Posting never blocks the
/// engine; a subscriber that dropped its receiver is pruned on the next post.
#[derive(Debug, Default)]
pub struct CommChannel {
    immediate_termination_requested: AtomicBool,
    subscribers: Mutex<Vec<Sender<Message>>>,
}

impl CommChannel {
    /// Create a channel with no subscribers and no pending termination request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the engine to abort the running script. Idempotent.
    pub fn request_termination(&self) {
        self.immediate_termination_requested
            .store(true, Ordering::Release);
    }

    /// Check whether termination has been requested.
    pub fn is_termination_requested(&self) -> bool {
        self.immediate_termination_requested.load(Ordering::Acquire)
    }

    /// Register a new observer and return its message receiver.
    pub fn subscribe(&self) -> Receiver<Message> {
        let (sender, receiver) = unbounded();
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Deliver a message to every live subscriber without blocking.
    pub fn post(&self, message: Message) {
        self.subscribers
            .lock()
            .retain(|sender| sender.send(message.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_termination_flag() {
        let channel = CommChannel::new();
        assert!(!channel.is_termination_requested());

        channel.request_termination();
        assert!(channel.is_termination_requested());

        // Idempotent
        channel.request_termination();
        assert!(channel.is_termination_requested());
    }

    #[test]
    fn test_post_and_subscribe_fifo() {
        let channel = CommChannel::new();
        let receiver = channel.subscribe();

        for i in 0..3 {
            channel.post(Message::new(MessageType::StepStarted, "Step started", Utc::now(), i));
        }

        for i in 0..3 {
            let msg = receiver.try_recv().unwrap();
            assert_eq!(msg.step_index, i);
            assert_eq!(msg.msg_type, MessageType::StepStarted);
        }
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_post_fans_out_to_all_subscribers() {
        let channel = CommChannel::new();
        let first = channel.subscribe();
        let second = channel.subscribe();

        channel.post(Message::new(MessageType::StepStopped, "done", Utc::now(), 0));

        assert_eq!(first.try_recv().unwrap().text, "done");
        assert_eq!(second.try_recv().unwrap().text, "done");
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let channel = CommChannel::new();
        let receiver = channel.subscribe();
        drop(receiver);

        // Must not error or block
        channel.post(Message::new(MessageType::StepStopped, "done", Utc::now(), 0));
        assert!(channel.subscribers.lock().is_empty());
    }

    #[test]
    fn test_flag_crosses_threads() {
        let channel = Arc::new(CommChannel::new());

        let observer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.request_termination())
        };
        observer.join().unwrap();

        assert!(channel.is_termination_requested());
    }

    #[test]
    fn test_message_serialization_round_trip() {
        let msg = Message::new(MessageType::StepStoppedWithError, "boom", Utc::now(), 7);

        let json = serde_json::to_string(&msg).unwrap();
        let deserialized: Message = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.msg_type, msg.msg_type);
        assert_eq!(deserialized.text, msg.text);
        assert_eq!(deserialized.timestamp, msg.timestamp);
        assert_eq!(deserialized.step_index, msg.step_index);
    }
}
