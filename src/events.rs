//! Event bus for task state changes.
//!
//! [`EventBus`] fans every [`TaskEvent`] out to all subscribers over a
//! `tokio::sync::broadcast` channel and keeps a bounded replay log next to
//! it. Every event gets a sequence number. A subscriber that falls behind
//! the channel (`RecvError::Lagged`) refills from the replay log instead
//! of silently skipping events, so delivery is at-least-once as long as
//! the subscriber is no further behind than the log is long.
//!
//! Events are published after the store update they describe has been
//! committed. A process crash between the two loses the event but never
//! the state change; subscribers that need certainty re-read the store.
//!
//! # Examples
//!
//! ```
//! use brain::events::EventBus;
//! use brain::{TaskEvent, TaskType};
//! use brain::domain::TaskRecord;
//! use chrono::Utc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = EventBus::new(16);
//! let mut sub = bus.subscribe();
//!
//! let record = TaskRecord::new(TaskType::MessagePush, serde_json::json!({}), 3, Utc::now());
//! bus.publish(TaskEvent::created(&record.task));
//!
//! let event = sub.recv().await.unwrap();
//! assert_eq!(event.task_id, record.task.id);
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::types::event::TaskEvent;

#[derive(Debug, Clone)]
struct Sequenced {
    seq: u64,
    event: TaskEvent,
}

#[derive(Debug)]
struct ReplayLog {
    entries: VecDeque<Sequenced>,
    next_seq: u64,
    capacity: usize,
}

impl ReplayLog {
    fn since(&self, after: u64) -> Vec<Sequenced> {
        self.entries
            .iter()
            .filter(|entry| entry.seq > after)
            .cloned()
            .collect()
    }
}

/// Broadcast bus with a bounded replay log.
///
/// Cloning is cheap; all clones publish into the same feed.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Sequenced>,
    log: Arc<Mutex<ReplayLog>>,
}

impl EventBus {
    /// Creates a bus whose channel and replay log each hold `capacity`
    /// events (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            log: Arc::new(Mutex::new(ReplayLog {
                entries: VecDeque::with_capacity(capacity),
                next_seq: 1,
                capacity,
            })),
        }
    }

    /// Publishes an event and returns its sequence number.
    ///
    /// Never blocks and never fails; with no subscribers the event only
    /// lands in the replay log.
    pub fn publish(&self, event: TaskEvent) -> u64 {
        let mut log = self.log.lock();
        let seq = log.next_seq;
        log.next_seq += 1;

        let entry = Sequenced { seq, event };
        if log.entries.len() == log.capacity {
            log.entries.pop_front();
        }
        log.entries.push_back(entry.clone());

        // Sent under the log lock so channel order matches sequence order.
        let _ = self.sender.send(entry);
        seq
    }

    /// Subscribes to events published from now on.
    pub fn subscribe(&self) -> EventSubscription {
        let log = self.log.lock();
        EventSubscription {
            receiver: self.sender.subscribe(),
            log: Arc::clone(&self.log),
            last_seq: log.next_seq - 1,
            backlog: VecDeque::new(),
        }
    }

    /// Subscribes and first replays every retained event with a sequence
    /// number greater than `after`.
    pub fn subscribe_from(&self, after: u64) -> EventSubscription {
        let log = self.log.lock();
        let backlog: VecDeque<Sequenced> = log.since(after).into();
        EventSubscription {
            receiver: self.sender.subscribe(),
            log: Arc::clone(&self.log),
            last_seq: log.next_seq - 1,
            backlog,
        }
    }

    /// Sequence number of the most recently published event (0 if none).
    pub fn last_seq(&self) -> u64 {
        self.log.lock().next_seq - 1
    }

    /// Retained events, oldest first.
    pub fn recent(&self) -> Vec<TaskEvent> {
        self.log
            .lock()
            .entries
            .iter()
            .map(|entry| entry.event.clone())
            .collect()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A subscriber's view of the feed.
///
/// Obtained from [`EventBus::subscribe`]. Dropping it unsubscribes.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: broadcast::Receiver<Sequenced>,
    log: Arc<Mutex<ReplayLog>>,
    last_seq: u64,
    backlog: VecDeque<Sequenced>,
}

impl EventSubscription {
    /// Waits for the next event. Returns `None` once every [`EventBus`]
    /// handle has been dropped and the feed is drained.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        if let Some(entry) = self.backlog.pop_front() {
            return Some(entry.event);
        }
        loop {
            match self.receiver.recv().await {
                Ok(entry) => {
                    if let Some(event) = self.accept(entry) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    if let Some(event) = self.refill(skipped) {
                        return Some(event);
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next event if one is already available.
    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        if let Some(entry) = self.backlog.pop_front() {
            return Some(entry.event);
        }
        loop {
            match self.receiver.try_recv() {
                Ok(entry) => {
                    if let Some(event) = self.accept(entry) {
                        return Some(event);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    if let Some(event) = self.refill(skipped) {
                        return Some(event);
                    }
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Sequence number of the last event handed out (or skipped over).
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Converts the subscription into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = TaskEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }

    fn accept(&mut self, entry: Sequenced) -> Option<TaskEvent> {
        if entry.seq <= self.last_seq {
            return None;
        }
        self.last_seq = entry.seq;
        Some(entry.event)
    }

    fn refill(&mut self, skipped: u64) -> Option<TaskEvent> {
        let replay = self.log.lock().since(self.last_seq);
        match replay.first() {
            Some(first) if first.seq > self.last_seq + 1 => {
                tracing::warn!(
                    skipped,
                    lost = first.seq - self.last_seq - 1,
                    "event subscriber fell behind the replay log; events lost"
                );
            }
            _ => {
                tracing::debug!(skipped, "event subscriber lagged; replaying from log");
            }
        }
        if let Some(last) = replay.last() {
            self.last_seq = last.seq;
        }
        self.backlog.extend(replay);
        self.backlog.pop_front().map(|entry| entry.event)
    }
}
