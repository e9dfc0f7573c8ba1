//! The `rset` module implements the per-key replica-set state the
//! coordinator consults on every packet: the highest acknowledged version, a
//! fixed array of replica ids, and a bitmap for idempotent membership.

use {
    crate::wire::{NodeId, Version},
    std::{
        cell::Cell,
        sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering},
    },
};

/// Replica array capacity; matches the 16-bit membership bitmap on the wire.
pub const MAX_REPLICAS: usize = 16;

thread_local! {
    static SET_INDEX: Cell<usize> = Cell::new(0);
}

fn next_set_index() -> usize {
    SET_INDEX.with(|i| {
        let v = i.get();
        i.set(v.wrapping_add(1));
        v
    })
}

/// All fields are updated with relaxed atomics. `insert` is a `fetch_or` on
/// the bitmap followed by an array append at `fetch_add(size)`; a racing
/// insert of the same replica is a no-op. `reset` is not atomic with ongoing
/// inserts; an insert lost across a reset was stale anyway and the next ack
/// at the new version re-populates.
pub struct ReplicaSet {
    ver_completed: AtomicU32,
    bitmap: AtomicU32,
    size: AtomicUsize,
    replicas: [AtomicU8; MAX_REPLICAS],
}

impl ReplicaSet {
    pub fn new(ver: Version, replica: NodeId) -> Self {
        let set = ReplicaSet {
            ver_completed: AtomicU32::new(0),
            bitmap: AtomicU32::new(0),
            size: AtomicUsize::new(0),
            replicas: Default::default(),
        };
        set.reset(ver, replica);
        set
    }

    pub fn ver_completed(&self) -> Version {
        self.ver_completed.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed).min(MAX_REPLICAS)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bitmap(&self) -> u32 {
        self.bitmap.load(Ordering::Relaxed)
    }

    pub fn contains(&self, replica: NodeId) -> bool {
        usize::from(replica) < MAX_REPLICAS && self.bitmap() & (1 << replica) != 0
    }

    /// Pick a replica by positional round robin over the current members.
    pub fn select(&self) -> NodeId {
        let size = self.len().max(1);
        self.replicas[next_set_index() % size].load(Ordering::Relaxed)
    }

    /// Add a replica if its bitmap bit was unset. Inserting an id past the
    /// array capacity is a clamped no-op.
    pub fn insert(&self, replica: NodeId) {
        if usize::from(replica) >= MAX_REPLICAS {
            return;
        }
        let bit = 1u32 << replica;
        let prev = self.bitmap.fetch_or(bit, Ordering::Relaxed);
        if prev & bit == 0 {
            let slot = self.size.fetch_add(1, Ordering::Relaxed);
            if slot < MAX_REPLICAS {
                self.replicas[slot].store(replica, Ordering::Relaxed);
            } else {
                self.size.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Collapse membership to `replica` at a freshly acknowledged `ver`.
    pub fn reset(&self, ver: Version, replica: NodeId) {
        self.ver_completed.store(ver, Ordering::Relaxed);
        self.replicas[0].store(replica, Ordering::Relaxed);
        self.size.store(1, Ordering::Relaxed);
        let bit = if usize::from(replica) < MAX_REPLICAS {
            1u32 << replica
        } else {
            0
        };
        self.bitmap.store(bit, Ordering::Relaxed);
    }

    pub fn members(&self) -> Vec<NodeId> {
        (0..self.len())
            .map(|i| self.replicas[i].load(Ordering::Relaxed))
            .collect()
    }
}

/// Round-robin rotation over the full server set, used to fan writes to
/// replicated keys out across all servers.
pub struct Rotor {
    ids: Vec<NodeId>,
}

impl Rotor {
    pub fn new(num_nodes: NodeId) -> Self {
        Rotor {
            ids: (0..num_nodes).collect(),
        }
    }

    pub fn select(&self) -> NodeId {
        self.ids[next_set_index() % self.ids.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_single_member() {
        let set = ReplicaSet::new(0, 3);
        assert_eq!(set.ver_completed(), 0);
        assert_eq!(set.len(), 1);
        assert_eq!(set.members(), vec![3]);
        assert!(set.contains(3));
        assert!(!set.contains(0));
    }

    #[test]
    fn test_insert_is_idempotent() {
        let set = ReplicaSet::new(0, 1);
        set.insert(2);
        set.insert(2);
        set.insert(2);
        assert_eq!(set.len(), 2);
        assert_eq!(set.bitmap().count_ones() as usize, set.len());
        let mut members = set.members();
        members.sort_unstable();
        assert_eq!(members, vec![1, 2]);
    }

    #[test]
    fn test_bitmap_popcount_matches_size() {
        let set = ReplicaSet::new(0, 0);
        for id in 0..8 {
            set.insert(id);
            set.insert(id);
            assert_eq!(set.bitmap().count_ones() as usize, set.len());
        }
        assert_eq!(set.len(), 8);
    }

    #[test]
    fn test_insert_clamps_at_capacity() {
        let set = ReplicaSet::new(0, 0);
        for id in 0..MAX_REPLICAS as NodeId {
            set.insert(id);
        }
        assert_eq!(set.len(), MAX_REPLICAS);
        // out-of-range ids never mutate size
        set.insert(MAX_REPLICAS as NodeId);
        set.insert(200);
        assert_eq!(set.len(), MAX_REPLICAS);
        // duplicates at capacity are still no-ops
        set.insert(5);
        assert_eq!(set.len(), MAX_REPLICAS);
    }

    #[test]
    fn test_reset_collapses_membership() {
        let set = ReplicaSet::new(0, 1);
        set.insert(2);
        set.insert(3);
        set.reset(9, 4);
        assert_eq!(set.ver_completed(), 9);
        assert_eq!(set.members(), vec![4]);
        assert_eq!(set.bitmap(), 1 << 4);
    }

    #[test]
    fn test_select_rotates_positionally() {
        let set = ReplicaSet::new(0, 5);
        set.insert(6);
        let picks: Vec<NodeId> = (0..4).map(|_| set.select()).collect();
        // strict alternation regardless of starting offset
        assert_ne!(picks[0], picks[1]);
        assert_eq!(picks[0], picks[2]);
        assert_eq!(picks[1], picks[3]);
    }

    #[test]
    fn test_rotor_covers_all_servers() {
        let rotor = Rotor::new(4);
        let mut seen: Vec<NodeId> = (0..8).map(|_| rotor.select()).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
