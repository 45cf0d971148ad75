//! Latest-wins coalescing of drag updates.
//!
//! A drag produces far more MOVE records than a link needs. The driver pushes
//! every update through a [`DragCoalescer`] and drains it on a fixed
//! interval; only the most recent MOVE per object survives a flush window.

use std::collections::HashMap;

use plane_types::{Action, ObjectUpdate};

/// Pending MOVEs keyed by object id, in first-seen order.
#[derive(Debug, Default)]
pub struct DragCoalescer {
    order: Vec<String>,
    pending: HashMap<String, ObjectUpdate>,
}

impl DragCoalescer {
    /// Create an empty coalescer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer an update.
    ///
    /// MOVEs are held (replacing any earlier MOVE for the same id) and
    /// `None` is returned. ADD and REMOVE discard that id's pending MOVE
    /// and are handed straight back so the caller sends them now, keeping
    /// per-object order intact.
    pub fn push(&mut self, update: ObjectUpdate) -> Option<ObjectUpdate> {
        match update.action {
            Action::Move => {
                if !self.pending.contains_key(&update.id) {
                    self.order.push(update.id.clone());
                }
                self.pending.insert(update.id.clone(), update);
                None
            }
            Action::Add | Action::Remove => {
                if self.pending.remove(&update.id).is_some() {
                    self.order.retain(|id| id != &update.id);
                }
                Some(update)
            }
        }
    }

    /// Take every pending MOVE, in first-seen order.
    pub fn drain(&mut self) -> Vec<ObjectUpdate> {
        let pending = &mut self.pending;
        self.order
            .drain(..)
            .filter_map(|id| pending.remove(&id))
            .collect()
    }

    /// Number of pending MOVEs.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_collapses_to_latest() {
        let mut coalescer = DragCoalescer::new();
        for i in 0..10 {
            assert!(coalescer
                .push(ObjectUpdate::moved("card", i as f64, 0.0, 10.0, 10.0))
                .is_none());
        }
        assert_eq!(coalescer.len(), 1);

        let flushed = coalescer.drain();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].x, 9.0);
        assert!(coalescer.is_empty());
    }

    #[test]
    fn drain_keeps_first_seen_order() {
        let mut coalescer = DragCoalescer::new();
        coalescer.push(ObjectUpdate::moved("b", 1.0, 0.0, 1.0, 1.0));
        coalescer.push(ObjectUpdate::moved("a", 1.0, 0.0, 1.0, 1.0));
        coalescer.push(ObjectUpdate::moved("b", 2.0, 0.0, 1.0, 1.0));

        let ids: Vec<_> = coalescer.drain().into_iter().map(|u| u.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn remove_discards_pending_move() {
        let mut coalescer = DragCoalescer::new();
        coalescer.push(ObjectUpdate::moved("card", 5.0, 5.0, 1.0, 1.0));

        let passed = coalescer.push(ObjectUpdate::remove("card"));
        assert_eq!(passed.map(|u| u.action), Some(Action::Remove));
        assert!(coalescer.drain().is_empty());
    }

    #[test]
    fn add_passes_through() {
        let mut coalescer = DragCoalescer::new();
        let add = ObjectUpdate::add("card", 0.0, 0.0, 1.0, 1.0);
        assert_eq!(coalescer.push(add.clone()), Some(add));
        assert!(coalescer.is_empty());
    }
}
