//! Link store - persistence for references, links and photo placements
//!
//! The store is the only place deletion is decided: a marker delete
//! consults the reference graph first. Photos stay as long as any surviving
//! marker in the same connected network can still reach them; deleting the
//! last survivor clears the whole network's photos and links.
//!
//! Two implementations:
//! - `MemoryLinkStore` for tests and the simulator
//! - `SledLinkStore`, an embedded key-value tree with JSON records under
//!   the key prefixes `ref/`, `link/` and `photo/`

use crate::pose::{compose_from_relative, compose_to_relative, Pose};
use crate::reference_graph::{DeletionDecision, Link, ReferenceGraph, ReferenceId};
use crate::visibility::AnchorId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown reference {0}")]
    UnknownReference(ReferenceId),

    #[error("Store lock poisoned")]
    Poisoned,
}

impl StoreError {
    fn storage(context: &str, e: impl std::fmt::Display) -> Self {
        Self::Storage(format!("{}: {}", context, e))
    }
}

/// Stored record of a marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub id: ReferenceId,
    pub deleted: bool,
}

/// Stored record of a photo, relative to the marker it was taken at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoPlacement {
    pub photo_id: AnchorId,
    pub reference_id: ReferenceId,

    /// Photo pose in the reference's local frame
    pub photo: Pose,

    /// Photographer pose in the reference's local frame
    pub avatar: Pose,

    /// Registration time, milliseconds since the Unix epoch
    #[serde(default)]
    pub registered_at_ms: u64,
}

impl PhotoPlacement {
    /// Records a photo registered while `reference` was localized at
    /// `reference_pose` in the session frame.
    pub fn from_session(
        photo_id: AnchorId,
        reference_id: ReferenceId,
        reference_pose: &Pose,
        photo: &Pose,
        avatar: &Pose,
    ) -> Self {
        Self {
            photo_id,
            reference_id,
            photo: compose_to_relative(reference_pose, photo),
            avatar: compose_to_relative(reference_pose, avatar),
            registered_at_ms: 0,
        }
    }

    /// Stamps the registration time. Times before the epoch stamp 0.
    pub fn registered_at(mut self, time: SystemTime) -> Self {
        self.registered_at_ms = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self
    }

    /// Session-frame `(photo, avatar)` given the resolved reference pose.
    pub fn place(&self, reference_pose: &Pose) -> (Pose, Pose) {
        (
            compose_from_relative(reference_pose, &self.photo),
            compose_from_relative(reference_pose, &self.avatar),
        )
    }
}

/// Persistence contract for the spatial records.
pub trait LinkStore: Send + Sync {
    /// Registers a marker. Re-registering keeps its deletion flag.
    fn put_reference(&self, id: ReferenceId) -> Result<(), StoreError>;

    /// Stores a link. Links never change once published, so an existing
    /// link for the same ordered pair is kept.
    fn put_link(&self, link: &Link) -> Result<(), StoreError>;

    fn put_placement(&self, placement: &PhotoPlacement) -> Result<(), StoreError>;

    /// All registered markers, deleted ones included.
    fn references(&self) -> Result<Vec<ReferenceId>, StoreError>;

    fn links_from(&self, id: ReferenceId) -> Result<Vec<Link>, StoreError>;

    /// Removes every link leaving or entering `id`, returning how many went.
    fn delete_links(&self, id: ReferenceId) -> Result<usize, StoreError>;

    fn placements_for(&self, reference_id: ReferenceId) -> Result<Vec<PhotoPlacement>, StoreError>;

    fn mark_reference_deleted(&self, id: ReferenceId) -> Result<(), StoreError>;

    /// Unknown markers count as not deleted.
    fn is_reference_deleted(&self, id: ReferenceId) -> Result<bool, StoreError>;

    /// Returns whether a placement was removed.
    fn delete_placement(&self, photo_id: AnchorId) -> Result<bool, StoreError>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

#[derive(Debug, Default)]
struct MemoryTables {
    references: BTreeMap<ReferenceId, ReferenceRecord>,
    links: BTreeMap<(ReferenceId, ReferenceId), Link>,
    placements: BTreeMap<AnchorId, PhotoPlacement>,
}

/// Link store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryLinkStore {
    tables: RwLock<MemoryTables>,
}

impl MemoryLinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryTables>, StoreError> {
        self.tables.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryTables>, StoreError> {
        self.tables.write().map_err(|_| StoreError::Poisoned)
    }
}

impl LinkStore for MemoryLinkStore {
    fn put_reference(&self, id: ReferenceId) -> Result<(), StoreError> {
        self.write()?
            .references
            .entry(id)
            .or_insert(ReferenceRecord { id, deleted: false });
        Ok(())
    }

    fn put_link(&self, link: &Link) -> Result<(), StoreError> {
        self.write()?
            .links
            .entry((link.from_id, link.to_id))
            .or_insert_with(|| link.clone());
        Ok(())
    }

    fn put_placement(&self, placement: &PhotoPlacement) -> Result<(), StoreError> {
        self.write()?
            .placements
            .insert(placement.photo_id, placement.clone());
        Ok(())
    }

    fn references(&self) -> Result<Vec<ReferenceId>, StoreError> {
        Ok(self.read()?.references.keys().copied().collect())
    }

    fn links_from(&self, id: ReferenceId) -> Result<Vec<Link>, StoreError> {
        Ok(self
            .read()?
            .links
            .range((id, ReferenceId::MIN)..=(id, ReferenceId::MAX))
            .map(|(_, link)| link.clone())
            .collect())
    }

    fn delete_links(&self, id: ReferenceId) -> Result<usize, StoreError> {
        let mut tables = self.write()?;
        let before = tables.links.len();
        tables.links.retain(|&(from, to), _| from != id && to != id);
        Ok(before - tables.links.len())
    }

    fn placements_for(&self, reference_id: ReferenceId) -> Result<Vec<PhotoPlacement>, StoreError> {
        Ok(self
            .read()?
            .placements
            .values()
            .filter(|p| p.reference_id == reference_id)
            .cloned()
            .collect())
    }

    fn mark_reference_deleted(&self, id: ReferenceId) -> Result<(), StoreError> {
        match self.write()?.references.get_mut(&id) {
            Some(record) => {
                record.deleted = true;
                Ok(())
            }
            None => Err(StoreError::UnknownReference(id)),
        }
    }

    fn is_reference_deleted(&self, id: ReferenceId) -> Result<bool, StoreError> {
        Ok(self
            .read()?
            .references
            .get(&id)
            .map(|r| r.deleted)
            .unwrap_or(false))
    }

    fn delete_placement(&self, photo_id: AnchorId) -> Result<bool, StoreError> {
        Ok(self.write()?.placements.remove(&photo_id).is_some())
    }
}

// ============================================================================
// SLED STORE
// ============================================================================

/// Sled-based persistent link store
///
/// Uses an embedded key-value database for durability.
pub struct SledLinkStore {
    db: sled::Db,
}

impl SledLinkStore {
    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::storage("Failed to open sled DB", e))?;
        Ok(Self { db })
    }

    /// Create a temporary store (for testing)
    #[cfg(test)]
    pub fn open_temp() -> Result<Self, StoreError> {
        let config = sled::Config::new().temporary(true);
        let db = config
            .open()
            .map_err(|e| StoreError::storage("Failed to open temp DB", e))?;
        Ok(Self { db })
    }

    fn reference_key(id: ReferenceId) -> String {
        format!("ref/{}", id)
    }

    fn link_key(from: ReferenceId, to: ReferenceId) -> String {
        format!("link/{}/{}", from, to)
    }

    fn placement_key(reference_id: ReferenceId, photo_id: AnchorId) -> String {
        format!("photo/{}/{}", reference_id, photo_id)
    }

    fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self
            .db
            .get(key.as_bytes())
            .map_err(|e| StoreError::storage("Get failed", e))?
        {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        self.db
            .insert(key.as_bytes(), bytes)
            .map_err(|e| StoreError::storage("Insert failed", e))?;
        self.db
            .flush()
            .map_err(|e| StoreError::storage("Flush failed", e))?;
        Ok(())
    }

    fn scan<T: serde::de::DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StoreError> {
        let mut records = Vec::new();
        for result in self.db.scan_prefix(prefix.as_bytes()) {
            let (_, value) = result.map_err(|e| StoreError::storage("Iteration failed", e))?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }
}

impl LinkStore for SledLinkStore {
    fn put_reference(&self, id: ReferenceId) -> Result<(), StoreError> {
        let key = Self::reference_key(id);
        if self.get::<ReferenceRecord>(&key)?.is_some() {
            return Ok(());
        }
        self.put(&key, &ReferenceRecord { id, deleted: false })
    }

    fn put_link(&self, link: &Link) -> Result<(), StoreError> {
        let key = Self::link_key(link.from_id, link.to_id);
        let exists = self
            .db
            .contains_key(key.as_bytes())
            .map_err(|e| StoreError::storage("Lookup failed", e))?;
        if exists {
            return Ok(());
        }
        self.put(&key, link)
    }

    fn put_placement(&self, placement: &PhotoPlacement) -> Result<(), StoreError> {
        self.put(
            &Self::placement_key(placement.reference_id, placement.photo_id),
            placement,
        )
    }

    fn references(&self) -> Result<Vec<ReferenceId>, StoreError> {
        let records: Vec<ReferenceRecord> = self.scan("ref/")?;
        let mut ids: Vec<ReferenceId> = records.into_iter().map(|r| r.id).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn links_from(&self, id: ReferenceId) -> Result<Vec<Link>, StoreError> {
        self.scan(&format!("link/{}/", id))
    }

    fn delete_links(&self, id: ReferenceId) -> Result<usize, StoreError> {
        let links: Vec<Link> = self.scan("link/")?;
        let mut removed = 0;
        for link in links.iter().filter(|l| l.from_id == id || l.to_id == id) {
            self.db
                .remove(Self::link_key(link.from_id, link.to_id).as_bytes())
                .map_err(|e| StoreError::storage("Remove failed", e))?;
            removed += 1;
        }
        self.db
            .flush()
            .map_err(|e| StoreError::storage("Flush failed", e))?;
        Ok(removed)
    }

    fn placements_for(&self, reference_id: ReferenceId) -> Result<Vec<PhotoPlacement>, StoreError> {
        self.scan(&format!("photo/{}/", reference_id))
    }

    fn mark_reference_deleted(&self, id: ReferenceId) -> Result<(), StoreError> {
        let key = Self::reference_key(id);
        let mut record: ReferenceRecord = self
            .get(&key)?
            .ok_or(StoreError::UnknownReference(id))?;
        record.deleted = true;
        self.put(&key, &record)
    }

    fn is_reference_deleted(&self, id: ReferenceId) -> Result<bool, StoreError> {
        Ok(self
            .get::<ReferenceRecord>(&Self::reference_key(id))?
            .map(|r| r.deleted)
            .unwrap_or(false))
    }

    fn delete_placement(&self, photo_id: AnchorId) -> Result<bool, StoreError> {
        let placements: Vec<PhotoPlacement> = self.scan("photo/")?;
        let Some(placement) = placements.into_iter().find(|p| p.photo_id == photo_id) else {
            return Ok(false);
        };

        self.db
            .remove(Self::placement_key(placement.reference_id, photo_id).as_bytes())
            .map_err(|e| StoreError::storage("Remove failed", e))?;
        self.db
            .flush()
            .map_err(|e| StoreError::storage("Flush failed", e))?;
        Ok(true)
    }
}

// ============================================================================
// GRAPH LOADING & DELETION
// ============================================================================

/// Loads the nodes in `ids` and every link leaving them.
pub fn load_graph(
    store: &dyn LinkStore,
    ids: &BTreeSet<ReferenceId>,
) -> Result<ReferenceGraph, StoreError> {
    let mut graph = ReferenceGraph::new();
    for &id in ids {
        graph.insert_node(id);
        graph.insert_links(store.links_from(id)?);
    }
    Ok(graph)
}

/// What a marker delete actually removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionOutcome {
    /// The marker's network lost its last survivor and was cleared
    pub cascaded: bool,

    /// Markers whose links and photos were removed, in id order
    pub removed_references: Vec<ReferenceId>,

    pub deleted_photos: Vec<AnchorId>,

    /// Photos kept because another marker still reaches them
    pub deferred_photos: Vec<AnchorId>,
}

/// Deletes a marker, cascading only when no marker in its connected
/// network survives.
///
/// Deleted markers keep relaying poses, so survivors are looked for in the
/// whole component, not only among direct neighbors. A cascade removes the
/// photos and links of every marker in the component, including photos
/// deferred by earlier deletes. `graph` must hold the component's links;
/// cascaded markers are removed from it.
pub fn delete_reference(
    store: &dyn LinkStore,
    graph: &mut ReferenceGraph,
    id: ReferenceId,
) -> Result<DeletionOutcome, StoreError> {
    if !store.references()?.contains(&id) {
        return Err(StoreError::UnknownReference(id));
    }

    let mut deleted = BTreeSet::new();
    for other in graph.connected_component(id) {
        if other != id && store.is_reference_deleted(other)? {
            deleted.insert(other);
        }
    }
    let decision = graph.deletion_decision(id, |other| deleted.contains(&other));

    store.mark_reference_deleted(id)?;

    let outcome = match decision {
        DeletionDecision::Cascade { component } => {
            let mut outcome = DeletionOutcome {
                cascaded: true,
                ..Default::default()
            };
            for reference_id in component {
                for placement in store.placements_for(reference_id)? {
                    store.delete_placement(placement.photo_id)?;
                    outcome.deleted_photos.push(placement.photo_id);
                }
                store.delete_links(reference_id)?;
                graph.remove_node(reference_id);
                outcome.removed_references.push(reference_id);
            }
            outcome
        }
        DeletionDecision::DeferPhotos { survivors } => {
            let photos: Vec<AnchorId> = store
                .placements_for(id)?
                .into_iter()
                .map(|p| p.photo_id)
                .collect();
            info!(
                "Reference {} deleted, {} photos kept via {:?}",
                id,
                photos.len(),
                survivors
            );
            DeletionOutcome {
                deferred_photos: photos,
                ..Default::default()
            }
        }
    };

    info!(
        "Deleted reference {} (cascaded: {}, photos removed: {})",
        id,
        outcome.cascaded,
        outcome.deleted_photos.len()
    );
    Ok(outcome)
}
