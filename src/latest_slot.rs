// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Single-cell, overwrite-on-publish register shared between one writer and
//! any number of readers.
//!
//! The writer never waits for readers: a publish replaces whatever is held,
//! and an unconsumed prior value is simply discarded. Readers either pull the
//! freshest value (`peek()`, `wait_newer()`) or register to be pushed each
//! update (`subscribe()`); a push listener whose channel is full misses that
//! update. Dropped values and missed pushes show up only in `stats()`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tokio::sync::mpsc::error::TrySendError;

/// Creates a slot. The writer half is not Clone, so each slot has exactly one
/// writer for its lifetime.
pub fn channel<T>() -> (SlotWriter<T>, SlotReader<T>) {
    let shared = Arc::new(Shared{
        cell: ArcSwapOption::empty(),
        last_read_version: AtomicU64::new(0),
        published: AtomicU64::new(0),
        overwritten_unread: AtomicU64::new(0),
        missed_notifications: AtomicU64::new(0),
        listeners: Mutex::new(Vec::new()),
        updated: Notify::new(),
        writer_closed: AtomicBool::new(false),
    });
    (SlotWriter{shared: shared.clone()}, SlotReader{shared})
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct SlotStats {
    pub published: u64,

    // Values replaced before any pull reader looked at them.
    pub overwritten_unread: u64,

    // Pushes skipped because a listener's channel was full.
    pub missed_notifications: u64,

    pub listeners: usize,
}

struct Versioned<T> {
    // 1 for the first publish, incremented per publish.
    version: u64,
    value: Arc<T>,
}

struct Shared<T> {
    cell: ArcSwapOption<Versioned<T>>,

    // Highest version returned by peek() or wait_newer().
    last_read_version: AtomicU64,

    published: AtomicU64,
    overwritten_unread: AtomicU64,
    missed_notifications: AtomicU64,

    listeners: Mutex<Vec<mpsc::Sender<Arc<T>>>>,

    // Wakes wait_newer() callers on publish and on writer drop.
    updated: Notify,

    // Only changes while `listeners` is locked, so a subscriber either sees
    // the writer open and is later cleared by its drop, or sees it closed.
    writer_closed: AtomicBool,
}

impl<T> Shared<T> {
    fn lock_listeners(&self) -> MutexGuard<'_, Vec<mpsc::Sender<Arc<T>>>> {
        match self.listeners.lock() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn load(&self) -> Option<Arc<Versioned<T>>> {
        let current = self.cell.load_full();
        if let Some(current) = &current {
            self.last_read_version.fetch_max(current.version, Ordering::AcqRel);
        }
        current
    }

    fn stats(&self) -> SlotStats {
        SlotStats{
            published: self.published.load(Ordering::Acquire),
            overwritten_unread: self.overwritten_unread.load(Ordering::Acquire),
            missed_notifications: self.missed_notifications.load(Ordering::Acquire),
            listeners: self.lock_listeners().len(),
        }
    }
}

pub struct SlotWriter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> SlotWriter<T> {
    /// Replaces the held value. Never blocks on readers.
    pub fn publish(&self, value: T) {
        let version = self.shared.published.fetch_add(1, Ordering::AcqRel) + 1;
        let value = Arc::new(value);
        let prior = self.shared.cell.swap(
            Some(Arc::new(Versioned{version, value: value.clone()})));
        if let Some(prior) = prior {
            if self.shared.last_read_version.load(Ordering::Acquire) < prior.version {
                self.shared.overwritten_unread.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.notify_listeners(&value);
        self.shared.updated.notify_waiters();
    }

    fn notify_listeners(&self, value: &Arc<T>) {
        let mut listeners = self.shared.lock_listeners();
        let missed = &self.shared.missed_notifications;
        listeners.retain(|listener| {
            match listener.try_send(value.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    missed.fetch_add(1, Ordering::AcqRel);
                    true
                },
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    pub fn reader(&self) -> SlotReader<T> {
        SlotReader{shared: self.shared.clone()}
    }
}

impl<T> Drop for SlotWriter<T> {
    fn drop(&mut self) {
        {
            let mut listeners = self.shared.lock_listeners();
            self.shared.writer_closed.store(true, Ordering::Release);
            // Dropping the senders ends every push listener's stream.
            listeners.clear();
        }
        self.shared.updated.notify_waiters();
    }
}

pub struct SlotReader<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SlotReader<T> {
    fn clone(&self) -> Self {
        SlotReader{shared: self.shared.clone()}
    }
}

impl<T> SlotReader<T> {
    /// The freshest value, or None if nothing was published yet. Does not
    /// consume; repeated calls return the same value until the next publish.
    pub fn peek(&self) -> Option<Arc<T>> {
        self.shared.load().map(|v| v.value.clone())
    }

    /// Like peek(), also returning the value's version (publish count).
    pub fn peek_versioned(&self) -> Option<(u64, Arc<T>)> {
        self.shared.load().map(|v| (v.version, v.value.clone()))
    }

    /// Waits until a value with version greater than `seen_version` is held
    /// and returns it. Returns None once the writer is gone and nothing newer
    /// will arrive. Pass 0 to get the current value (or the first one).
    pub async fn wait_newer(&self, seen_version: u64) -> Option<(u64, Arc<T>)> {
        loop {
            // Register before checking, so a publish in between is not lost.
            let updated = self.shared.updated.notified();
            if let Some(current) = self.shared.load() {
                if current.version > seen_version {
                    return Some((current.version, current.value.clone()));
                }
            }
            if self.shared.writer_closed.load(Ordering::Acquire) {
                return None;
            }
            updated.await;
        }
    }

    /// Registers a push listener. Each publish is offered to the channel
    /// without waiting; if the channel is full that publish is skipped for
    /// this listener. The stream ends when the writer is dropped.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<Arc<T>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut listeners = self.shared.lock_listeners();
        if !self.shared.writer_closed.load(Ordering::Acquire) {
            listeners.push(tx);
        }
        // Otherwise tx is dropped here; the stream is already over.
        rx
    }

    pub fn stats(&self) -> SlotStats {
        self.shared.stats()
    }
}

// mod tests.
