//! The `client` module drives load at the fabric: a workload generator with
//! uniform or Zipf key popularity, tunable op mix and send rate, and the
//! request/reply loop that measures per-op latency.

use {
    crate::{
        config::Config,
        result::Result,
        stats::LatencyStats,
        streamer,
        timing,
        wire::{
            compute_keyhash, KvMessage, KvOperation, KvRequest, MessageCodec, NodeId, OpKind,
            BASE_VERSION,
        },
    },
    crossbeam_channel::unbounded,
    log::{debug, info},
    rand::Rng,
    std::{
        collections::VecDeque,
        net::UdpSocket,
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Arc, Mutex,
        },
        thread::{sleep, Builder},
        time::{Duration, Instant},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyDist {
    Uniform,
    Zipf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dynamism {
    None,
    /// Rotate the coldest keys to the front of the popularity order.
    HotIn,
    /// Shuffle random keys through the popularity order.
    Random,
}

#[derive(Clone, Debug)]
pub struct WorkloadConfig {
    pub value_len: usize,
    pub get_ratio: f64,
    pub put_ratio: f64,
    pub mean_interval: Duration,
    pub alpha: f64,
    pub key_dist: KeyDist,
    pub dynamism: Dynamism,
    pub d_interval: Duration,
    pub d_nkeys: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        WorkloadConfig {
            value_len: 256,
            get_ratio: 0.5,
            put_ratio: 0.5,
            mean_interval: Duration::from_micros(1000),
            alpha: 0.5,
            key_dist: KeyDist::Uniform,
            dynamism: Dynamism::None,
            d_interval: Duration::from_secs(1),
            d_nkeys: 100,
        }
    }
}

pub struct WorkloadGenerator {
    keys: Mutex<VecDeque<String>>,
    zipf_cdf: Vec<f64>,
    value: Vec<u8>,
    config: WorkloadConfig,
    last_change: Mutex<Instant>,
}

impl WorkloadGenerator {
    pub fn new(keys: Vec<String>, config: WorkloadConfig) -> Self {
        assert!(!keys.is_empty());
        let zipf_cdf = match config.key_dist {
            KeyDist::Uniform => Vec::new(),
            KeyDist::Zipf => {
                let norm: f64 = (1..=keys.len())
                    .map(|rank| 1.0 / (rank as f64).powf(config.alpha))
                    .sum();
                let mut sum = 0.0;
                (1..=keys.len())
                    .map(|rank| {
                        sum += 1.0 / (rank as f64).powf(config.alpha) / norm;
                        sum
                    })
                    .collect()
            }
        };
        WorkloadGenerator {
            keys: Mutex::new(keys.into_iter().collect()),
            zipf_cdf,
            value: vec![b'v'; config.value_len],
            config,
            last_change: Mutex::new(Instant::now()),
        }
    }

    fn next_key_index(&self, nkeys: usize) -> usize {
        let mut rng = rand::thread_rng();
        match self.config.key_dist {
            KeyDist::Uniform => rng.gen_range(0..nkeys),
            KeyDist::Zipf => {
                let coin: f64 = rng.gen_range(f64::EPSILON..1.0);
                self.zipf_cdf
                    .partition_point(|&cum| cum < coin)
                    .min(nkeys - 1)
            }
        }
    }

    fn next_op_kind(&self) -> OpKind {
        let coin: f64 = rand::thread_rng().gen();
        if coin < self.config.get_ratio {
            OpKind::Get
        } else if coin < self.config.get_ratio + self.config.put_ratio {
            OpKind::Put
        } else {
            OpKind::Del
        }
    }

    /// Exponential gap between sends, so arrivals form a Poisson process at
    /// the configured mean rate.
    fn next_interval(&self) -> Duration {
        let coin: f64 = rand::thread_rng().gen_range(f64::EPSILON..1.0);
        let mean = self.config.mean_interval.as_micros() as f64;
        Duration::from_micros((-coin.ln() * mean) as u64)
    }

    fn maybe_change_keys(&self) {
        if self.config.dynamism == Dynamism::None {
            return;
        }
        {
            let mut last_change = self.last_change.lock().unwrap();
            if last_change.elapsed() < self.config.d_interval {
                return;
            }
            *last_change = Instant::now();
        }
        let mut keys = self.keys.lock().unwrap();
        let nkeys = keys.len();
        match self.config.dynamism {
            Dynamism::None => (),
            Dynamism::HotIn => {
                for _ in 0..self.config.d_nkeys.min(nkeys) {
                    let back = keys.pop_back().unwrap();
                    keys.push_front(back);
                }
            }
            Dynamism::Random => {
                let mut rng = rand::thread_rng();
                for _ in 0..self.config.d_nkeys {
                    let a = rng.gen_range(0..nkeys);
                    let b = rng.gen_range(0..nkeys);
                    keys.swap(a, b);
                }
            }
        }
        debug!("workload popularity order changed");
    }

    pub fn next_operation(&self) -> (KvOperation, Duration) {
        self.maybe_change_keys();
        let keys = self.keys.lock().unwrap();
        let key = keys[self.next_key_index(keys.len())].clone();
        drop(keys);
        let op = self.next_op_kind();
        let value = if op == OpKind::Put {
            self.value.clone()
        } else {
            Vec::new()
        };
        let operation = KvOperation {
            op,
            keyhash: compute_keyhash(&key),
            ver: BASE_VERSION,
            key,
            value,
        };
        (operation, self.next_interval())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteMode {
    /// Address servers directly by key partition.
    Static,
    /// Send everything at the coordinator.
    Coordinator,
}

fn request_destination(
    config: &Config,
    route: RouteMode,
    op: &KvOperation,
    server_id: NodeId,
) -> std::net::SocketAddr {
    match route {
        RouteMode::Coordinator => config.lb.expect("coordinator route requires lb").addr(),
        RouteMode::Static => {
            // reads go to the tail rack, writes enter at the head
            let rack = if op.op == OpKind::Get {
                config.num_racks() - 1
            } else {
                0
            };
            config.node(rack, usize::from(server_id)).addr()
        }
    }
}

/// Issue the workload for `duration`, reading replies off the same socket,
/// then stop recording. The caller dumps `stats`.
#[allow(clippy::too_many_arguments)]
pub fn run_workload(
    config: Arc<Config>,
    client_id: NodeId,
    codec: Arc<dyn MessageCodec>,
    generator: Arc<WorkloadGenerator>,
    route: RouteMode,
    duration: Duration,
    num_threads: usize,
    stats: Arc<LatencyStats>,
    sock: UdpSocket,
) -> Result<()> {
    let exit = Arc::new(AtomicBool::new(false));
    let sock = Arc::new(sock);
    let (packet_sender, packet_receiver) = unbounded();
    let t_receiver = streamer::receiver(sock.clone(), exit.clone(), packet_sender, "client");

    let t_sink = {
        let codec = codec.clone();
        let stats = stats.clone();
        let exit = exit.clone();
        Builder::new()
            .name("skmr-client-sink".to_string())
            .spawn(move || loop {
                let batch = match packet_receiver.recv_timeout(Duration::from_millis(200)) {
                    Ok(batch) => batch,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        if exit.load(Ordering::Relaxed) {
                            break;
                        }
                        continue;
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                };
                for packet in &batch {
                    if let Ok(KvMessage::Reply(reply)) = codec.decode(packet.payload()) {
                        let now = timing::timestamp_us() as u32;
                        let latency = now.wrapping_sub(reply.req_time);
                        stats.report_op(reply.op, u64::from(latency), reply.result);
                    }
                }
            })
            .unwrap()
    };

    stats.start();
    let req_id = Arc::new(AtomicU32::new(1));
    let senders: Vec<_> = (0..num_threads.max(1))
        .map(|i| {
            let config = config.clone();
            let codec = codec.clone();
            let generator = generator.clone();
            let stats = stats.clone();
            let sock = sock.clone();
            let req_id = req_id.clone();
            Builder::new()
                .name(format!("skmr-client-{i}"))
                .spawn(move || -> Result<()> {
                    let deadline = Instant::now() + duration;
                    while Instant::now() < deadline {
                        let (op, wait) = generator.next_operation();
                        sleep(wait);
                        let server_id =
                            (op.keyhash % config.num_nodes() as u32) as NodeId;
                        let dst = request_destination(&config, route, &op, server_id);
                        let request = KvMessage::Request(KvRequest {
                            client_id,
                            server_id,
                            req_id: req_id.fetch_add(1, Ordering::Relaxed),
                            req_time: timing::timestamp_us() as u32,
                            op,
                        });
                        let buf = codec.encode(&request)?;
                        if sock.send_to(&buf, dst).is_ok() {
                            stats.report_issue();
                        }
                    }
                    Ok(())
                })
                .unwrap()
        })
        .collect();

    // keep the first sender failure (e.g. a key the codec cannot carry) but
    // shut the receive side down before propagating it
    let mut sender_result = Ok(());
    for sender in senders {
        let result = sender.join()?;
        if sender_result.is_ok() {
            sender_result = result;
        }
    }
    // linger for stragglers before closing the books
    sleep(Duration::from_millis(100));
    stats.done();
    info!("workload finished: {} completed", stats.completed());
    exit.store(true, Ordering::Relaxed);
    t_receiver.join()?;
    t_sink.join()?;
    sender_result
}
