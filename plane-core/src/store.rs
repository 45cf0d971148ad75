//! Synchronized object table.
//!
//! The Master's table is authoritative; a Slave's is a cache overwritten by
//! whatever the Master relays. Both apply records the same way (last
//! applied wins), so the [`Authority`] tag is informational only.

use std::collections::HashMap;

use plane_types::{Action, ObjectUpdate};
use serde::Serialize;

/// One object on the plane, in VU.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncObject {
    /// Object identifier
    pub id: String,
    /// Left edge
    pub x: f64,
    /// Top edge
    pub y: f64,
    /// Width
    pub width: f64,
    /// Height
    pub height: f64,
}

impl SyncObject {
    fn from_update(update: &ObjectUpdate) -> Self {
        Self {
            id: update.id.clone(),
            x: update.x,
            y: update.y,
            width: update.width,
            height: update.height,
        }
    }

    fn same_geometry(&self, update: &ObjectUpdate) -> bool {
        self.x == update.x
            && self.y == update.y
            && self.width == update.width
            && self.height == update.height
    }
}

/// Whether a store is the session's source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Authority {
    /// Master-side table
    Authoritative,
    /// Slave-side replica
    Cache,
}

/// Map from object id to geometry.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    authority: Authority,
    objects: HashMap<String, SyncObject>,
}

impl ObjectStore {
    /// Create an empty store.
    pub fn new(authority: Authority) -> Self {
        Self {
            authority,
            objects: HashMap::new(),
        }
    }

    /// Current authority tag.
    pub fn authority(&self) -> Authority {
        self.authority
    }

    /// Change the authority tag (on role change). Contents are kept.
    pub fn set_authority(&mut self, authority: Authority) {
        self.authority = authority;
    }

    /// Apply one update. Returns `true` if the table changed.
    ///
    /// ADD and MOVE both upsert; REMOVE of an unknown id is a no-op.
    /// Coordinates are not validated.
    pub fn apply(&mut self, update: &ObjectUpdate) -> bool {
        match update.action {
            Action::Add | Action::Move => match self.objects.get_mut(&update.id) {
                Some(existing) if existing.same_geometry(update) => false,
                Some(existing) => {
                    *existing = SyncObject::from_update(update);
                    true
                }
                None => {
                    self.objects
                        .insert(update.id.clone(), SyncObject::from_update(update));
                    true
                }
            },
            Action::Remove => self.objects.remove(&update.id).is_some(),
        }
    }

    /// Look up one object.
    pub fn get(&self, id: &str) -> Option<&SyncObject> {
        self.objects.get(id)
    }

    /// All objects, sorted by id.
    pub fn snapshot(&self) -> Vec<SyncObject> {
        let mut objects: Vec<_> = self.objects.values().cloned().collect();
        objects.sort_by(|a, b| a.id.cmp(&b.id));
        objects
    }

    /// The whole table as ADD records, sorted by id. Replayed to a joining
    /// Slave.
    pub fn as_add_records(&self) -> Vec<ObjectUpdate> {
        self.snapshot()
            .into_iter()
            .map(|o| ObjectUpdate::add(o.id, o.x, o.y, o.width, o.height))
            .collect()
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Drop every object.
    pub fn clear(&mut self) {
        self.objects.clear();
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new(Authority::Cache)
    }
}
