// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Publish/subscribe bus shared by the session core and its consumers.
//!
//! The bus is constructed once and handed to every component. It keeps no
//! history: a listener only sees events posted while it is registered.

use parking_lot::{ReentrantMutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use crate::events::{Event, EventParseError};

/// Callback invoked for every posted event.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Serializes invocations of one listener against its removal.
struct Gate {
    active: AtomicBool,
    /// Held while the listener runs. Reentrant so a listener may post or
    /// unsubscribe itself on its own thread.
    running: ReentrantMutex<()>,
}

struct Entry {
    id: ListenerId,
    gate: Arc<Gate>,
    listener: Listener,
}

#[derive(Default)]
struct BusInner {
    listeners: RwLock<Vec<Entry>>,
    next_id: AtomicU64,
}

/// Cloneable handle to one bus instance.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Registering the same closure twice yields two
    /// independent registrations.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push(Entry {
            id,
            gate: Arc::new(Gate {
                active: AtomicBool::new(true),
                running: ReentrantMutex::new(()),
            }),
            listener: Arc::new(listener),
        });
        debug!("Listener {:?} subscribed", id);
        id
    }

    /// Remove a listener. Unknown ids are ignored.
    ///
    /// Once this returns, the listener is not invoked again, including by a
    /// `post` already iterating on another thread. An invocation in progress
    /// on another thread is waited for.
    pub fn unsubscribe(&self, id: ListenerId) {
        let entry = {
            let mut listeners = self.inner.listeners.write();
            let Some(pos) = listeners.iter().position(|e| e.id == id) else {
                return;
            };
            listeners.remove(pos)
        };
        entry.gate.active.store(false, Ordering::SeqCst);
        drop(entry.gate.running.lock());
        debug!("Listener {:?} unsubscribed", id);
    }

    /// Deliver `event` to every listener registered when the call begins.
    ///
    /// Listeners run on the caller's thread without the table lock held, so
    /// they may subscribe, unsubscribe or post re-entrantly. A panicking
    /// listener is logged and skipped.
    pub fn post(&self, event: Event) {
        debug!("Posting event: {}", event);

        let snapshot: Vec<(ListenerId, Arc<Gate>, Listener)> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|e| (e.id, e.gate.clone(), e.listener.clone()))
            .collect();

        for (id, gate, listener) in snapshot {
            let _running = gate.running.lock();
            if !gate.active.load(Ordering::SeqCst) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!("Listener {:?} panicked while handling {}", id, event.tag());
            }
        }
    }

    /// Decode a raw `TAG:data` string and post it.
    pub fn post_encoded(&self, raw: &str) -> Result<(), EventParseError> {
        let event = raw.parse::<Event>()?;
        self.post(event);
        Ok(())
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }
}
