//! Probe registry.
//!
//! Maps attachment keys to ordered lists of installed probes. Each key holds
//! an immutable snapshot (`Arc<[Arc<InstalledProbe>]>`) that install and
//! detach replace wholesale, so a dispatcher that took a snapshot sees either
//! the list before or after a concurrent change, never a half-built one, and
//! a detached probe stays alive until the last in-flight run drops it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use hashbrown::HashMap;
use spin::RwLock;

use crate::context::AttachmentKey;
use crate::stats::ProbeStats;
use crate::verifier::ProbeProgram;

/// Handle of an installed probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId(u32);

impl ProbeId {
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn from_u32(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "probe#{}", self.0)
    }
}

/// A program installed at its attachment key.
#[derive(Debug)]
pub struct InstalledProbe {
    pub id: ProbeId,
    pub program: ProbeProgram,
    pub stats: ProbeStats,
}

/// Probes attached to one key, in installation order.
pub type ProbeList = Arc<[Arc<InstalledProbe>]>;

/// Concurrent key to probe-list map.
///
/// Writers build the replacement list before taking the lock and install it
/// only if the list they started from is still current. The critical
/// section is a pointer swap; growing the table for a key seen for the first
/// time is the only allocation made under the lock.
pub struct ProbeRegistry {
    lists: RwLock<HashMap<AttachmentKey, ProbeList>>,
    next_id: AtomicU32,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self {
            lists: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Append `program` to the list of its key and return its id.
    pub fn install(&self, program: ProbeProgram) -> ProbeId {
        let id = ProbeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let key = program.key();
        let probe = Arc::new(InstalledProbe {
            id,
            program,
            stats: ProbeStats::new(),
        });

        loop {
            let seen = self.lookup(&key);
            let list: ProbeList = match &seen {
                Some(old) => old
                    .iter()
                    .cloned()
                    .chain(core::iter::once(Arc::clone(&probe)))
                    .collect(),
                None => Arc::from([Arc::clone(&probe)]),
            };
            if self.swap(key, seen.as_ref(), Some(list)).is_ok() {
                break;
            }
        }

        log::debug!("Installed {} at {}", id, key);
        id
    }

    /// Remove probe `id`. Returns `false` if it is not installed.
    pub fn detach(&self, id: ProbeId) -> bool {
        loop {
            let Some((key, seen)) = self.find(id) else {
                return false;
            };
            let remaining: Vec<Arc<InstalledProbe>> =
                seen.iter().filter(|p| p.id != id).cloned().collect();
            let list = (!remaining.is_empty()).then(|| ProbeList::from(remaining));
            if self.swap(key, Some(&seen), list).is_ok() {
                log::debug!("Detached {} from {}", id, key);
                return true;
            }
        }
    }

    /// Replace the list at `key` with `new` if it is still `seen`.
    ///
    /// Returns the displaced list, or hands `new` back on conflict, so the
    /// caller drops either one after the lock is released.
    fn swap(
        &self,
        key: AttachmentKey,
        seen: Option<&ProbeList>,
        new: Option<ProbeList>,
    ) -> Result<Option<ProbeList>, Option<ProbeList>> {
        let mut lists = self.lists.write();
        let current = match (lists.get(&key), seen) {
            (None, None) => true,
            (Some(now), Some(seen)) => Arc::ptr_eq(now, seen),
            _ => false,
        };
        if !current {
            return Err(new);
        }
        Ok(match new {
            Some(list) => lists.insert(key, list),
            None => lists.remove(&key),
        })
    }

    /// Key and current list holding probe `id`.
    fn find(&self, id: ProbeId) -> Option<(AttachmentKey, ProbeList)> {
        self.lists
            .read()
            .iter()
            .find(|(_, list)| list.iter().any(|p| p.id == id))
            .map(|(key, list)| (*key, Arc::clone(list)))
    }

    /// Snapshot of the probes at `key`, in installation order.
    ///
    /// Only clones an `Arc`; never allocates.
    pub fn lookup(&self, key: &AttachmentKey) -> Option<ProbeList> {
        self.lists.read().get(key).cloned()
    }

    /// Installed probe `id`.
    pub fn get(&self, id: ProbeId) -> Option<Arc<InstalledProbe>> {
        let (_, list) = self.find(id)?;
        list.iter().find(|p| p.id == id).cloned()
    }

    /// All installed probes, by ascending id.
    pub fn probes(&self) -> Vec<Arc<InstalledProbe>> {
        let mut all: Vec<_> = self
            .lists
            .read()
            .values()
            .flat_map(|list| list.iter().cloned())
            .collect();
        all.sort_by_key(|p| p.id);
        all
    }

    pub fn len(&self) -> usize {
        self.lists.read().values().map(|list| list.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.read().is_empty()
    }
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProbeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeRegistry")
            .field("keys", &self.lists.read().len())
            .field("probes", &self.len())
            .finish()
    }
}
