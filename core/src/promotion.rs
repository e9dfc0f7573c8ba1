//! The `promotion` module runs the coordinator's control plane: every stats
//! epoch it compares the hottest unreplicated keys against the coldest
//! replicated ones, swaps them in the R-set, and seeds rack-local
//! replication for each newly promoted key.

use {
    crate::{
        config::Config,
        fabric::Fabric,
        service::Service,
        wire::{ControlCodec, ControlMessage, Keyhash, NodeId},
    },
    crossbeam_channel::{Receiver, RecvTimeoutError, Sender},
    log::{debug, info, trace},
    std::{
        net::UdpSocket,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, sleep, Builder, JoinHandle},
        time::Duration,
    },
};

/// A newly promoted key whose home server must be told to seed replication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedRequest {
    pub keyhash: Keyhash,
    pub key: String,
    pub home: NodeId,
}

/// One promotion epoch: snapshot and clear the access stats, then walk the
/// hot unreplicated keys against the coldest replicated ones.
pub fn run_epoch(fabric: &Fabric, mut seed: impl FnMut(SeedRequest)) {
    let stats = fabric.take_epoch_stats();

    let mut hot_ukeys: Vec<(Keyhash, String, u64)> = stats
        .hot_ukey
        .iter()
        .map(|entry| {
            let count = stats
                .ukey_access_count
                .get(entry.key())
                .map(|c| *c)
                .unwrap_or(0);
            (*entry.key(), entry.value().clone(), count)
        })
        .collect();
    hot_ukeys.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));

    let mut cold_rkeys: Vec<(Keyhash, u64)> = stats
        .rkey_access_count
        .iter()
        .filter(|entry| fabric.rset_contains(*entry.key()))
        .map(|entry| (*entry.key(), *entry.value()))
        .collect();
    cold_rkeys.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));

    let mut cold = cold_rkeys.into_iter().peekable();
    for (keyhash, key, count) in hot_ukeys {
        if fabric.rset_len() < fabric.tuning().max_rset_size {
            promote(fabric, keyhash, &key, &mut seed);
        } else if matches!(cold.peek(), Some(&(_, cold_count)) if count > cold_count) {
            let (evicted, _) = cold.next().unwrap();
            if evicted != keyhash {
                fabric.evict(evicted);
                trace!("evicted rkey {evicted:#x} for {keyhash:#x}");
                promote(fabric, keyhash, &key, &mut seed);
            }
        } else {
            break;
        }
    }
}

fn promote(fabric: &Fabric, keyhash: Keyhash, key: &str, seed: &mut impl FnMut(SeedRequest)) {
    if let Some(home) = fabric.promote(keyhash) {
        info!("promoted key {keyhash:#x} home {home}");
        seed(SeedRequest {
            keyhash,
            key: key.to_string(),
            home,
        });
    }
}

/// Background worker that runs `run_epoch` every `tuning.epoch` and pushes
/// seed requests to the transmit side.
pub struct PromotionService {
    thread_hdls: Vec<JoinHandle<()>>,
}

impl PromotionService {
    pub fn new(
        fabric: Arc<Fabric>,
        seed_sender: Sender<SeedRequest>,
        exit: Arc<AtomicBool>,
    ) -> Self {
        let thread_hdl = Builder::new()
            .name("skmr-promotion".to_string())
            .spawn(move || {
                let epoch = fabric.tuning().epoch;
                loop {
                    sleep(epoch);
                    if exit.load(Ordering::Relaxed) {
                        break;
                    }
                    run_epoch(&fabric, |request| {
                        if seed_sender.send(request).is_err() {
                            debug!("seed channel disconnected");
                        }
                    });
                }
            })
            .unwrap();
        PromotionService {
            thread_hdls: vec![thread_hdl],
        }
    }
}

impl Service for PromotionService {
    fn thread_hdls(self) -> Vec<JoinHandle<()>> {
        self.thread_hdls
    }

    fn join(self) -> thread::Result<()> {
        for thread_hdl in self.thread_hdls() {
            thread_hdl.join()?;
        }
        Ok(())
    }
}

/// Encode seed requests as `REPLICATION` control messages and push them to
/// each key's home server in the coordinator's rack.
pub fn seed_forwarder(
    config: Arc<Config>,
    sock: Arc<UdpSocket>,
    receiver: Receiver<SeedRequest>,
    exit: Arc<AtomicBool>,
) -> JoinHandle<()> {
    Builder::new()
        .name("skmr-seeder".to_string())
        .spawn(move || {
            let codec = ControlCodec::new();
            loop {
                match receiver.recv_timeout(Duration::from_millis(250)) {
                    Ok(request) => {
                        let msg = ControlMessage::Replication {
                            keyhash: request.keyhash,
                            key: request.key,
                        };
                        let buf = codec.encode(&msg).expect("encode replication seed");
                        let dst = config.node(0, usize::from(request.home)).addr();
                        if let Err(err) = sock.send_to(&buf, dst) {
                            debug!("seed send to {dst} failed: {err}");
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if exit.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .unwrap()
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            fabric::{FabricTuning, Steer, SteerHeader},
            wire::{compute_keyhash, OP_GET},
        },
    };

    fn steer_gets(fabric: &Fabric, key: &str, n: usize) {
        let keyhash = compute_keyhash(key);
        for _ in 0..n {
            let mut hdr = SteerHeader {
                op: OP_GET,
                keyhash,
                client_id: 0,
                server_id: 0,
                load: 0,
                ver: 0,
            };
            assert!(matches!(fabric.steer(&mut hdr, Some(key)), Steer::ToServer(_)));
        }
    }

    fn tuning(max_rset_size: usize) -> FabricTuning {
        FabricTuning {
            max_rset_size,
            sample_rate: 1,
            hk_threshold: 5,
            ..FabricTuning::default()
        }
    }

    #[test]
    fn test_promotion_under_load() {
        let fabric = Fabric::with_tuning(4, tuning(32));
        steer_gets(&fabric, "hot", 1000);
        let mut seeds = Vec::new();
        run_epoch(&fabric, |seed| seeds.push(seed));

        let keyhash = compute_keyhash("hot");
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].keyhash, keyhash);
        assert_eq!(seeds[0].key, "hot");
        assert_eq!(seeds[0].home, fabric.home(keyhash));
        assert!(fabric.rset_contains(keyhash));
        assert_eq!(
            fabric.replica_members(keyhash).unwrap(),
            vec![fabric.home(keyhash)]
        );
    }

    #[test]
    fn test_cold_keys_not_promoted() {
        let fabric = Fabric::with_tuning(4, tuning(32));
        steer_gets(&fabric, "lukewarm", 3);
        let mut seeds = Vec::new();
        run_epoch(&fabric, |seed| seeds.push(seed));
        assert!(seeds.is_empty());
        assert_eq!(fabric.rset_len(), 0);
    }

    #[test]
    fn test_evict_coldest() {
        let fabric = Fabric::with_tuning(4, tuning(2));
        let cold = compute_keyhash("cold");
        let warm = compute_keyhash("warm");
        fabric.promote(cold).unwrap();
        fabric.promote(warm).unwrap();

        steer_gets(&fabric, "cold", 3);
        steer_gets(&fabric, "warm", 100);
        steer_gets(&fabric, "rising", 50);
        let mut seeds = Vec::new();
        run_epoch(&fabric, |seed| seeds.push(seed));

        assert_eq!(fabric.rset_len(), 2);
        assert!(!fabric.rset_contains(cold));
        assert!(fabric.rset_contains(warm));
        assert!(fabric.rset_contains(compute_keyhash("rising")));
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].key, "rising");

        // a barely-accessed newcomer does not displace anyone
        steer_gets(&fabric, "warm", 100);
        steer_gets(&fabric, "rising", 50);
        steer_gets(&fabric, "trickle", 2);
        let mut seeds = Vec::new();
        run_epoch(&fabric, |seed| seeds.push(seed));
        assert!(seeds.is_empty());
        assert_eq!(fabric.rset_len(), 2);
        assert!(fabric.rset_contains(warm));
        assert!(fabric.rset_contains(compute_keyhash("rising")));
    }

    #[test]
    fn test_rset_bounded_by_capacity() {
        let fabric = Fabric::with_tuning(4, tuning(3));
        for i in 0..10 {
            steer_gets(&fabric, &format!("key-{i}"), 10);
        }
        run_epoch(&fabric, |_| {});
        assert!(fabric.rset_len() <= 3);
    }
}
