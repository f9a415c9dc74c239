//! Typed publish/subscribe primitives.
//!
//! `Notifier<T>` is the minimal event mechanism behind `data`/`exit`
//! notifications: register a listener, get a [`Subscription`] back, fan out
//! synchronously on `fire`. Listeners run on whichever thread fires (for
//! channel data, the reader thread) so they must be `Send`.
//!
//! `CloseEvent` is the once-only variant used for `close`: it remembers that
//! it fired, and a listener registered afterwards runs immediately.
//! `ExitLatch` carries the one exit record from the native callback to the
//! agent, whichever side arrives first.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::core::terminal::ExitRecord;

type Listener<T> = Box<dyn FnMut(&T) + Send>;

struct Entry<T> {
    id: u64,
    once: bool,
    listener: Listener<T>,
}

struct Table<T> {
    next_id: u64,
    entries: Vec<Entry<T>>,
    /// Ids disposed while their entry was checked out by a `fire` in
    /// progress; filtered when the entries are returned.
    disposed: HashSet<u64>,
}

/// Synchronous fan-out notifier.
pub struct Notifier<T> {
    table: Arc<Mutex<Table<T>>>,
}

impl<T> Clone for Notifier<T> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
        }
    }
}

impl<T: 'static> Notifier<T> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                next_id: 0,
                entries: Vec::new(),
                disposed: HashSet::new(),
            })),
        }
    }

    /// Register a listener. It stays registered until the returned
    /// subscription is disposed.
    pub fn subscribe(&self, listener: impl FnMut(&T) + Send + 'static) -> Subscription {
        self.add(Box::new(listener), false)
    }

    /// Register a listener that is removed after its first invocation.
    pub fn once(&self, listener: impl FnMut(&T) + Send + 'static) -> Subscription {
        self.add(Box::new(listener), true)
    }

    fn add(&self, listener: Listener<T>, once: bool) -> Subscription {
        let id = {
            let mut table = self.table.lock().unwrap();
            let id = table.next_id;
            table.next_id += 1;
            table.entries.push(Entry { id, once, listener });
            id
        };
        let table = self.table.clone();
        Subscription::new(move || {
            let mut table = table.lock().unwrap();
            if let Some(pos) = table.entries.iter().position(|e| e.id == id) {
                table.entries.remove(pos);
            } else {
                // Checked out by a fire in progress; drop it on return.
                table.disposed.insert(id);
            }
        })
    }

    /// Invoke every registered listener in registration order.
    ///
    /// Listeners are checked out of the table for the duration of the call
    /// so they may subscribe or dispose without deadlocking.
    pub fn fire(&self, value: &T) {
        let mut active = {
            let mut table = self.table.lock().unwrap();
            std::mem::take(&mut table.entries)
        };
        for entry in &mut active {
            (entry.listener)(value);
        }
        let mut table = self.table.lock().unwrap();
        let added_during_fire = std::mem::take(&mut table.entries);
        active.retain(|e| !e.once && !table.disposed.remove(&e.id));
        active.extend(added_during_fire);
        table.entries = active;
    }

    pub fn listener_count(&self) -> usize {
        self.table.lock().unwrap().entries.len()
    }

    /// Drop every listener.
    pub fn clear(&self) {
        self.table.lock().unwrap().entries.clear();
    }
}

impl<T: 'static> Default for Notifier<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for removing a registered listener.
///
/// Dropping the handle does not unregister the listener; call
/// [`Subscription::dispose`] to remove it.
pub struct Subscription {
    disposer: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(disposer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            disposer: Some(Box::new(disposer)),
        }
    }

    /// Remove the listener this subscription refers to.
    pub fn dispose(mut self) {
        if let Some(disposer) = self.disposer.take() {
            disposer();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

struct CloseState {
    emitted: bool,
    next_id: u64,
    listeners: Vec<(u64, Box<dyn FnOnce() + Send>)>,
}

/// Once-only close notification.
///
/// Fires at most once. A listener registered after the event already fired
/// is invoked immediately, which is what makes "run this when the channel is
/// closed" race-free for callers that may subscribe late.
pub struct CloseEvent {
    state: Arc<Mutex<CloseState>>,
}

impl Clone for CloseEvent {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl CloseEvent {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CloseState {
                emitted: false,
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Register a one-shot close listener; runs immediately when the event
    /// has already fired.
    pub fn subscribe(&self, listener: impl FnOnce() + Send + 'static) -> Subscription {
        let id = {
            let mut state = self.state.lock().unwrap();
            if state.emitted {
                drop(state);
                listener();
                return Subscription::new(|| {});
            }
            let id = state.next_id;
            state.next_id += 1;
            state.listeners.push((id, Box::new(listener)));
            id
        };
        let state = self.state.clone();
        Subscription::new(move || {
            let mut state = state.lock().unwrap();
            if let Some(pos) = state.listeners.iter().position(|(lid, _)| *lid == id) {
                state.listeners.remove(pos);
            }
        })
    }

    /// Fire the event. Every call after the first is a no-op.
    pub fn emit(&self) {
        let listeners = {
            let mut state = self.state.lock().unwrap();
            if state.emitted {
                return;
            }
            state.emitted = true;
            std::mem::take(&mut state.listeners)
        };
        for (_, listener) in listeners {
            listener();
        }
    }

    pub fn has_emitted(&self) -> bool {
        self.state.lock().unwrap().emitted
    }
}

impl Default for CloseEvent {
    fn default() -> Self {
        Self::new()
    }
}

enum LatchState {
    Waiting,
    Fired(ExitRecord),
    Handler(Box<dyn FnOnce(ExitRecord) + Send>),
    Done,
}

/// Hand-off slot between the native exit callback and the agent.
///
/// The callback may fire before the agent finishes wiring its channels, and
/// the agent may install its handler before the process exits; whichever
/// side arrives second completes the hand-off. Both sides are one-shot.
pub struct ExitLatch {
    state: Mutex<LatchState>,
}

impl ExitLatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::Waiting),
        }
    }

    /// Called from the native exit callback.
    pub fn fire(&self, record: ExitRecord) {
        let handler = {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(&mut *state, LatchState::Done) {
                LatchState::Waiting => {
                    *state = LatchState::Fired(record);
                    None
                }
                LatchState::Handler(handler) => Some(handler),
                other => {
                    *state = other;
                    None
                }
            }
        };
        if let Some(handler) = handler {
            handler(record);
        }
    }

    /// Install the agent-side handler. Runs immediately when the exit
    /// already fired.
    pub fn set_handler(&self, handler: impl FnOnce(ExitRecord) + Send + 'static) {
        let fired = {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(&mut *state, LatchState::Done) {
                LatchState::Waiting => {
                    *state = LatchState::Handler(Box::new(handler));
                    return;
                }
                LatchState::Fired(record) => Some(record),
                other => {
                    *state = other;
                    None
                }
            }
        };
        if let Some(record) = fired {
            handler(record);
        }
    }
}

impl Default for ExitLatch {
    fn default() -> Self {
        Self::new()
    }
}
