//! Fan-out of "reload" requests across independent surfaces.
//!
//! The registry never owns its subscribers. Each entry pairs a weak reference
//! with a liveness flag owned by the [`Subscription`] handed back to the
//! subscriber; an entry is dead once either the subscriber is gone or its
//! subscription was dropped. Dead entries are compacted lazily before every
//! subscribe and every broadcast.

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use tracing::{debug, error};

use crate::surface::SurfaceId;

pub trait ReloadSubscriber {
    fn page_should_be_reloaded(&self);
}

struct Entry {
    id: SurfaceId,
    alive: Rc<Cell<bool>>,
    target: Weak<dyn ReloadSubscriber>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.alive.get() && self.target.strong_count() > 0
    }
}

/// Keeps a registry entry alive; dropping it removes the subscriber from
/// future broadcasts.
#[derive(Debug)]
pub struct Subscription {
    id: SurfaceId,
    alive: Rc<Cell<bool>>,
}

impl Subscription {
    pub fn id(&self) -> SurfaceId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.alive.set(false);
    }
}

#[derive(Default)]
pub struct BroadcastReloadRegistry {
    entries: RefCell<Vec<Entry>>,
}

thread_local! {
    static SHARED: Rc<BroadcastReloadRegistry> = Rc::new(BroadcastReloadRegistry::new());
}

impl BroadcastReloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every surface on the control thread.
    pub fn shared() -> Rc<Self> {
        SHARED.with(Rc::clone)
    }

    pub fn subscribe(&self, id: SurfaceId, subscriber: Weak<dyn ReloadSubscriber>) -> Subscription {
        self.compact();
        let alive = Rc::new(Cell::new(true));
        self.entries.borrow_mut().push(Entry {
            id,
            alive: Rc::clone(&alive),
            target: subscriber,
        });
        debug!(surface = %id, "subscribed to reload broadcasts");
        Subscription { id, alive }
    }

    /// Asks every live subscriber other than `except` to reload.
    ///
    /// A panicking subscriber is logged and skipped; the remaining
    /// subscribers are still notified. Returns how many were notified.
    pub fn request_reload_all(&self, except: Option<SurfaceId>) -> usize {
        self.compact();
        let targets: Vec<(SurfaceId, Rc<dyn ReloadSubscriber>)> = self
            .entries
            .borrow()
            .iter()
            .filter(|entry| Some(entry.id) != except)
            .filter_map(|entry| entry.target.upgrade().map(|target| (entry.id, target)))
            .collect();

        debug!(
            except = ?except,
            count = targets.len(),
            "broadcasting reload request"
        );

        for (id, target) in &targets {
            if let Err(panic_err) = catch_unwind(AssertUnwindSafe(|| target.page_should_be_reloaded())) {
                error!(surface = %id, panic = ?panic_err, "reload subscriber panicked");
            }
        }
        targets.len()
    }

    pub fn live_count(&self) -> usize {
        self.entries.borrow().iter().filter(|entry| entry.is_live()).count()
    }

    fn compact(&self) {
        self.entries.borrow_mut().retain(Entry::is_live);
    }
}
