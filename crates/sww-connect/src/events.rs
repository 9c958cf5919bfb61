//! Listener registry for coordinator events.
//!
//! One list per category. Dispatch is synchronous and in registration order,
//! and always happens after the coordinator has released its state lock, so
//! listeners may call back into the coordinator.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use sww_common::Payload;

use crate::coordinator::{Connection, ConnectionStatus};

/// A decrypted message from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub envelope_id: String,
    pub sender_id: String,
    pub timestamp: u64,
    pub payload: Payload,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called here.
    Local,
    /// The peer closed or deleted the session record.
    Remote,
    /// The session outlived its lifetime.
    Expired,
}

/// Internal event queue entry.
#[derive(Debug, Clone)]
pub(crate) enum Event {
    Connected(Connection),
    Payload(InboundMessage),
    Disconnected(DisconnectReason),
    Status(ConnectionStatus),
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Connected,
    Payload,
    Disconnected,
    Status,
}

struct Slot<T> {
    entries: Vec<(u64, Listener<T>)>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> Slot<T> {
    fn snapshot(&self) -> Vec<Listener<T>> {
        self.entries.iter().map(|(_, l)| l.clone()).collect()
    }

    fn remove(&mut self, id: u64) {
        self.entries.retain(|(entry, _)| *entry != id);
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    connected: Slot<Connection>,
    payload: Slot<InboundMessage>,
    disconnected: Slot<DisconnectReason>,
    status: Slot<ConnectionStatus>,
}

/// Registered listeners, shared with every [`ListenerHandle`].
#[derive(Clone, Default)]
pub struct EventHub {
    registry: Arc<Mutex<Registry>>,
}

/// Keeps one registration alive. Dropping it removes the listener.
#[derive(Debug)]
#[must_use = "dropping a ListenerHandle removes the listener"]
pub struct ListenerHandle {
    registry: Weak<Mutex<Registry>>,
    category: Category,
    id: u64,
}

impl ListenerHandle {
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut reg = registry.lock().unwrap_or_else(|e| e.into_inner());
        match self.category {
            Category::Connected => reg.connected.remove(self.id),
            Category::Payload => reg.payload.remove(self.id),
            Category::Disconnected => reg.disconnected.remove(self.id),
            Category::Status => reg.status.remove(self.id),
        }
    }
}

impl EventHub {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self, category: Category, id: u64) -> ListenerHandle {
        ListenerHandle {
            registry: Arc::downgrade(&self.registry),
            category,
            id,
        }
    }

    pub fn on_connected(&self, f: impl Fn(&Connection) + Send + Sync + 'static) -> ListenerHandle {
        let mut reg = self.lock();
        reg.next_id += 1;
        let id = reg.next_id;
        reg.connected.entries.push((id, Arc::new(f)));
        drop(reg);
        self.handle(Category::Connected, id)
    }

    pub fn on_payload(
        &self,
        f: impl Fn(&InboundMessage) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let mut reg = self.lock();
        reg.next_id += 1;
        let id = reg.next_id;
        reg.payload.entries.push((id, Arc::new(f)));
        drop(reg);
        self.handle(Category::Payload, id)
    }

    pub fn on_disconnected(
        &self,
        f: impl Fn(&DisconnectReason) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let mut reg = self.lock();
        reg.next_id += 1;
        let id = reg.next_id;
        reg.disconnected.entries.push((id, Arc::new(f)));
        drop(reg);
        self.handle(Category::Disconnected, id)
    }

    pub fn on_status(
        &self,
        f: impl Fn(&ConnectionStatus) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let mut reg = self.lock();
        reg.next_id += 1;
        let id = reg.next_id;
        reg.status.entries.push((id, Arc::new(f)));
        drop(reg);
        self.handle(Category::Status, id)
    }

    /// Deliver one event to its listeners.
    pub(crate) fn emit(&self, event: &Event) {
        match event {
            Event::Connected(c) => {
                let listeners = self.lock().connected.snapshot();
                listeners.iter().for_each(|l| l(c));
            }
            Event::Payload(m) => {
                let listeners = self.lock().payload.snapshot();
                listeners.iter().for_each(|l| l(m));
            }
            Event::Disconnected(r) => {
                let listeners = self.lock().disconnected.snapshot();
                listeners.iter().for_each(|l| l(r));
            }
            Event::Status(s) => {
                let listeners = self.lock().status.snapshot();
                listeners.iter().for_each(|l| l(s));
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        let reg = self.lock();
        reg.connected.entries.len()
            + reg.payload.entries.len()
            + reg.disconnected.entries.len()
            + reg.status.entries.len()
    }
}
