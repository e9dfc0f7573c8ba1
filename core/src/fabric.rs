//! The `fabric` module owns the coordinator's process-wide state: the global
//! write-version counter, the replicated-key set, the all-servers write
//! rotation, and the sampled access statistics the promotion loop feeds on.
//! Every data-plane worker shares one `Fabric` by reference.

use {
    crate::{
        rset::{ReplicaSet, Rotor},
        wire::{
            Keyhash, Load, NodeId, Version, OP_DEC, OP_DEL, OP_GET, OP_PUT, OP_RC_ACK,
            OP_RC_REQ, OP_REP_R, OP_REP_W,
        },
    },
    dashmap::DashMap,
    log::trace,
    skimmer_metrics::inc_new_counter_debug,
    std::{
        cell::Cell,
        sync::{
            atomic::{AtomicU32, AtomicUsize, Ordering},
            RwLock,
        },
        time::Duration,
    },
};

pub const MAX_RSET_SIZE: usize = 32;
pub const STATS_SAMPLE_RATE: u64 = 100;
pub const HK_THRESHOLD: u64 = 5;
pub const STATS_EPOCH: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
pub struct FabricTuning {
    pub max_rset_size: usize,
    pub sample_rate: u64,
    pub hk_threshold: u64,
    pub epoch: Duration,
}

impl Default for FabricTuning {
    fn default() -> Self {
        FabricTuning {
            max_rset_size: MAX_RSET_SIZE,
            sample_rate: STATS_SAMPLE_RATE,
            hk_threshold: HK_THRESHOLD,
            epoch: STATS_EPOCH,
        }
    }
}

/// Per-epoch access counters. Bumped under the read lock by sampled
/// data-plane accesses; swapped out wholesale under the write lock by the
/// promotion loop.
#[derive(Default)]
pub struct AccessStats {
    pub ukey_access_count: DashMap<Keyhash, u64>,
    pub rkey_access_count: DashMap<Keyhash, u64>,
    /// Unreplicated keys whose sampled count crossed the hot-key threshold,
    /// with the key bytes captured for seeding.
    pub hot_ukey: DashMap<Keyhash, String>,
}

/// The parsed steering header of an in-flight packet. The data plane mutates
/// it in place and rewrites it into the packet buffer before forwarding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SteerHeader {
    pub op: u8,
    pub keyhash: Keyhash,
    pub client_id: NodeId,
    pub server_id: NodeId,
    pub load: Load,
    pub ver: Version,
}

/// Forwarding decision for one packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Steer {
    ToServer(NodeId),
    ToClient(NodeId),
    Drop,
}

thread_local! {
    static ACCESS_COUNT: Cell<u64> = Cell::new(0);
}

pub struct Fabric {
    num_nodes: NodeId,
    tuning: FabricTuning,
    ver_next: AtomicU32,
    rset: DashMap<Keyhash, ReplicaSet>,
    rset_len: AtomicUsize,
    all_servers: Rotor,
    stats: RwLock<AccessStats>,
}

impl Fabric {
    pub fn new(num_nodes: NodeId) -> Self {
        Self::with_tuning(num_nodes, FabricTuning::default())
    }

    pub fn with_tuning(num_nodes: NodeId, tuning: FabricTuning) -> Self {
        assert!(num_nodes > 0);
        Fabric {
            num_nodes,
            tuning,
            ver_next: AtomicU32::new(1),
            rset: DashMap::new(),
            rset_len: AtomicUsize::new(0),
            all_servers: Rotor::new(num_nodes),
            stats: RwLock::new(AccessStats::default()),
        }
    }

    pub fn num_nodes(&self) -> NodeId {
        self.num_nodes
    }

    pub fn tuning(&self) -> &FabricTuning {
        &self.tuning
    }

    /// Issue the next write version. A single fetch-add shared by all
    /// data-plane threads totally orders writes.
    pub fn next_version(&self) -> Version {
        self.ver_next.fetch_add(1, Ordering::Relaxed)
    }

    /// Home server of a key: the initial and permanent replica.
    pub fn home(&self, keyhash: Keyhash) -> NodeId {
        (keyhash % Keyhash::from(self.num_nodes)) as NodeId
    }

    /// The per-packet decision: classify, pick a destination, stamp a
    /// version on writes, fold replies into replica membership, and record
    /// the sampled access. `key` is the key carried in a request payload,
    /// captured into the hot-key table when sampling promotes the key.
    pub fn steer(&self, header: &mut SteerHeader, key: Option<&str>) -> Steer {
        match header.op {
            OP_GET => {
                let replicated = if let Some(set) = self.rset.get(&header.keyhash) {
                    header.server_id = set.select();
                    true
                } else {
                    false
                };
                self.record_access(header.keyhash, replicated, key);
                Steer::ToServer(header.server_id)
            }
            OP_PUT | OP_DEL => {
                header.ver = self.next_version();
                let replicated = if self.rset.contains_key(&header.keyhash) {
                    header.server_id = self.all_servers.select();
                    true
                } else {
                    false
                };
                self.record_access(header.keyhash, replicated, key);
                Steer::ToServer(header.server_id)
            }
            OP_REP_R | OP_REP_W => {
                self.fold_ack(header.keyhash, header.ver, header.server_id);
                Steer::ToClient(header.client_id)
            }
            OP_RC_REQ => Steer::ToServer(header.server_id),
            OP_RC_ACK => {
                self.fold_ack(header.keyhash, header.ver, header.server_id);
                Steer::Drop
            }
            OP_DEC => Steer::Drop,
            op => {
                trace!("dropping packet with unexpected op {op:#x}");
                inc_new_counter_debug!("fabric-unexpected_op", 1);
                Steer::Drop
            }
        }
    }

    /// Reply rule: a higher acknowledged version collapses the set to the
    /// acker, an equal one widens it, a stale one is ignored.
    fn fold_ack(&self, keyhash: Keyhash, ver: Version, server_id: NodeId) {
        if let Some(set) = self.rset.get(&keyhash) {
            let completed = set.ver_completed();
            if ver > completed {
                set.reset(ver, server_id);
            } else if ver == completed {
                set.insert(server_id);
            }
        }
    }

    fn record_access(&self, keyhash: Keyhash, replicated: bool, key: Option<&str>) {
        let count = ACCESS_COUNT.with(|c| {
            let v = c.get().wrapping_add(1);
            c.set(v);
            v
        });
        if count % self.tuning.sample_rate != 0 {
            return;
        }
        let stats = self.stats.read().unwrap();
        if replicated {
            *stats.rkey_access_count.entry(keyhash).or_insert(0) += 1;
        } else {
            let mut entry = stats.ukey_access_count.entry(keyhash).or_insert(0);
            *entry += 1;
            if *entry >= self.tuning.hk_threshold {
                stats
                    .hot_ukey
                    .entry(keyhash)
                    .or_insert_with(|| key.unwrap_or_default().to_string());
            }
        }
    }

    /// Swap the epoch's counters out under the write lock, leaving fresh
    /// empty maps for the next epoch.
    pub fn take_epoch_stats(&self) -> AccessStats {
        let mut stats = self.stats.write().unwrap();
        std::mem::take(&mut *stats)
    }

    pub fn rset_len(&self) -> usize {
        self.rset_len.load(Ordering::Relaxed)
    }

    pub fn rset_contains(&self, keyhash: Keyhash) -> bool {
        self.rset.contains_key(&keyhash)
    }

    pub fn replica_members(&self, keyhash: Keyhash) -> Option<Vec<NodeId>> {
        self.rset.get(&keyhash).map(|set| set.members())
    }

    pub fn ver_completed(&self, keyhash: Keyhash) -> Option<Version> {
        self.rset.get(&keyhash).map(|set| set.ver_completed())
    }

    /// Create an R-set entry seeded with the key's home server. Returns the
    /// home id if the entry is new; the promotion loop then seeds rack-local
    /// replication. Only the promotion thread calls this.
    pub fn promote(&self, keyhash: Keyhash) -> Option<NodeId> {
        let home = self.home(keyhash);
        match self.rset.entry(keyhash) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(ReplicaSet::new(0, home));
                self.rset_len.fetch_add(1, Ordering::Relaxed);
                Some(home)
            }
        }
    }

    /// Drop an R-set entry. In-flight replies for it become no-ops. Only the
    /// promotion thread calls this.
    pub fn evict(&self, keyhash: Keyhash) -> bool {
        let removed = self.rset.remove(&keyhash).is_some();
        if removed {
            self.rset_len.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }
}
