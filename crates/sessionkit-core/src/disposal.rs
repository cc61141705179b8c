//! Values that reset themselves when the user logs out.

use crate::events::Events;

/// A consumer-owned value that returns to its initial state after logout.
///
/// The snapshot is taken at construction. Every access compares the logout
/// generation with the one last seen and restores the snapshot if any
/// `auth:loggedOut` was published in between. Other events never reset it.
pub struct Disposable<T: Clone> {
    origin: T,
    current: T,
    events: Events,
    seen: u64,
}

impl<T: Clone> Disposable<T> {
    pub fn new(value: T, events: &Events) -> Self {
        Self {
            origin: value.clone(),
            current: value,
            events: events.clone(),
            seen: events.logout_generation(),
        }
    }

    pub fn get(&mut self) -> &T {
        self.sync();
        &self.current
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.sync();
        &mut self.current
    }

    pub fn set(&mut self, value: T) {
        self.sync();
        self.current = value;
    }

    /// Restore the snapshot now
    pub fn dispose(&mut self) {
        self.current = self.origin.clone();
    }

    fn sync(&mut self) {
        let generation = self.events.logout_generation();
        if generation != self.seen {
            self.seen = generation;
            self.dispose();
        }
    }
}
