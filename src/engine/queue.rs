//! Keyed work queue with per-key serialization
//!
//! Multiple pending triggers for the same cluster collapse into one queued
//! item, and a cluster is never processed by two workers at once: a key
//! re-added while in flight is marked dirty and re-enqueued when the
//! in-flight pass completes. Delayed re-adds back requeue intervals and
//! back-off schedules.

use crate::resource::ClusterKey;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ClusterKey>,
    queued: HashSet<ClusterKey>,
    active: HashSet<ClusterKey>,
    dirty: HashSet<ClusterKey>,
    shutdown: bool,
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    /// Enqueue a key. Deduplicates against pending items; a key currently
    /// being processed is marked dirty and re-enqueued on completion.
    pub fn add(&self, key: ClusterKey) {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        if state.active.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            self.notify.notify_one();
        }
    }

    /// Enqueue a key after a delay.
    pub fn add_after(self: &Arc<Self>, key: ClusterKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Take the next key to process, waiting if the queue is empty.
    /// Returns `None` once the queue has shut down and drained.
    pub async fn next(&self) -> Option<ClusterKey> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    return Some(key);
                }
                if state.shutdown {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark an in-flight key as finished, re-enqueueing it if it was dirtied
    /// while being processed.
    pub fn done(&self, key: &ClusterKey) {
        let mut state = self.state.lock().unwrap();
        state.active.remove(key);
        if state.dirty.remove(key) && !state.shutdown && state.queued.insert(key.clone()) {
            state.queue.push_back(key.clone());
            self.notify.notify_one();
        }
    }

    /// Stop accepting new work and wake all waiting workers. Pending items
    /// are still drained.
    pub fn shut_down(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
