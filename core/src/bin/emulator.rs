//! Emulator entry point: runs one fabric role (client, server, coordinator,
//! controller, or decrementor) over the UDP transport.

use {
    clap::{App, Arg},
    crossbeam_channel::unbounded,
    log::info,
    skimmer_core::{
        client::{self, Dynamism, KeyDist, RouteMode, WorkloadConfig, WorkloadGenerator},
        config::Config,
        controller,
        coordinator::CoordinatorService,
        decrementor::DecrementorService,
        fabric::{Fabric, FabricTuning},
        promotion::{self, PromotionService},
        server::{ServerNode, ServerService},
        service::Service,
        stats::LatencyStats,
        store::Store,
        wire::{InlineCodec, MessageCodec, NodeId, SteerCodec},
    },
    skimmer_netutil::bind_to,
    std::{
        fs::File,
        io::{BufRead, BufReader},
        net::UdpSocket,
        path::Path,
        process::exit,
        sync::{atomic::AtomicBool, Arc},
        time::Duration,
    },
};

fn fatal(msg: &str) -> ! {
    eprintln!("{msg}");
    exit(1);
}

fn read_keys(path: &str, nkeys: usize) -> Vec<String> {
    let file = File::open(Path::new(path))
        .unwrap_or_else(|err| fatal(&format!("failed to open keys file {path}: {err}")));
    let keys: Vec<String> = BufReader::new(file)
        .lines()
        .take(nkeys)
        .collect::<std::io::Result<_>>()
        .unwrap_or_else(|err| fatal(&format!("failed to read keys file {path}: {err}")));
    if keys.is_empty() {
        fatal(&format!("keys file {path} is empty"));
    }
    keys
}

fn parse_arg<T: std::str::FromStr>(matches: &clap::ArgMatches, name: &str, default: T) -> T {
    match matches.value_of(name) {
        Some(value) => value
            .parse()
            .unwrap_or_else(|_| fatal(&format!("invalid value for --{name}: {value}"))),
        None => default,
    }
}

fn main() {
    skimmer_logger::setup_with_default("info");
    let matches = App::new("skimmer-emulator")
        .about("Load-aware replication fabric emulator")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .takes_value(true)
                .required(true)
                .help("Topology configuration file"),
        )
        .arg(
            Arg::with_name("role")
                .short("m")
                .long("role")
                .value_name("ROLE")
                .takes_value(true)
                .required(true)
                .possible_values(&["client", "server", "lb", "controller", "decrementor"])
                .help("Node role to run"),
        )
        .arg(
            Arg::with_name("transport")
                .short("o")
                .long("transport")
                .value_name("MODE")
                .takes_value(true)
                .possible_values(&["udp", "dpdk"])
                .help("Transport to use [default: udp]"),
        )
        .arg(
            Arg::with_name("protocol")
                .short("w")
                .long("protocol")
                .value_name("MODE")
                .takes_value(true)
                .possible_values(&["static", "router", "netcache"])
                .help("Protocol variant [default: static]"),
        )
        .arg(
            Arg::with_name("rack-id")
                .short("r")
                .long("rack-id")
                .value_name("NUM")
                .takes_value(true)
                .help("Rack id of this server"),
        )
        .arg(
            Arg::with_name("node-id")
                .short("e")
                .long("node-id")
                .value_name("NUM")
                .takes_value(true)
                .help("Node id of this server, or client id for clients"),
        )
        .arg(
            Arg::with_name("threads")
                .short("b")
                .long("threads")
                .value_name("NUM")
                .takes_value(true)
                .help("Worker threads [default: 1]"),
        )
        .arg(
            Arg::with_name("keys-file")
                .short("f")
                .long("keys-file")
                .value_name("FILE")
                .takes_value(true)
                .help("File with one key per line"),
        )
        .arg(
            Arg::with_name("num-keys")
                .short("n")
                .long("num-keys")
                .value_name("NUM")
                .takes_value(true)
                .help("Number of keys to use from the keys file [default: 1000]"),
        )
        .arg(
            Arg::with_name("value-len")
                .short("v")
                .long("value-len")
                .value_name("BYTES")
                .takes_value(true)
                .help("Value length for writes and preloads [default: 256]"),
        )
        .arg(
            Arg::with_name("get-ratio")
                .short("g")
                .long("get-ratio")
                .value_name("RATIO")
                .takes_value(true)
                .help("Fraction of GET operations [default: 0.5]"),
        )
        .arg(
            Arg::with_name("put-ratio")
                .short("p")
                .long("put-ratio")
                .value_name("RATIO")
                .takes_value(true)
                .help("Fraction of PUT operations [default: 0.5]"),
        )
        .arg(
            Arg::with_name("key-dist")
                .short("t")
                .long("key-dist")
                .value_name("DIST")
                .takes_value(true)
                .possible_values(&["unif", "zipf"])
                .help("Key popularity distribution [default: unif]"),
        )
        .arg(
            Arg::with_name("alpha")
                .short("a")
                .long("alpha")
                .value_name("FLOAT")
                .takes_value(true)
                .help("Zipf skew parameter [default: 0.5]"),
        )
        .arg(
            Arg::with_name("interval")
                .short("i")
                .long("interval")
                .value_name("USEC")
                .takes_value(true)
                .help("Mean inter-request interval in microseconds [default: 1000]"),
        )
        .arg(
            Arg::with_name("duration")
                .short("d")
                .long("duration")
                .value_name("SECS")
                .takes_value(true)
                .help("Client run duration in seconds [default: 5]"),
        )
        .arg(
            Arg::with_name("stats-file")
                .short("s")
                .long("stats-file")
                .value_name("FILE")
                .takes_value(true)
                .help("Dump the latency histogram to FILE"),
        )
        .arg(
            Arg::with_name("dynamism")
                .short("F")
                .long("dynamism")
                .value_name("MODE")
                .takes_value(true)
                .possible_values(&["none", "hotin", "random"])
                .help("Workload dynamism [default: none]"),
        )
        .arg(
            Arg::with_name("d-interval")
                .short("G")
                .long("d-interval")
                .value_name("SECS")
                .takes_value(true)
                .help("Interval between popularity changes [default: 1]"),
        )
        .arg(
            Arg::with_name("d-nkeys")
                .short("H")
                .long("d-nkeys")
                .value_name("NUM")
                .takes_value(true)
                .help("Keys moved per popularity change [default: 100]"),
        )
        .arg(
            Arg::with_name("num-rkeys")
                .short("C")
                .long("num-rkeys")
                .value_name("NUM")
                .takes_value(true)
                .help("Replicated-key budget [default: 32]"),
        )
        .arg(
            Arg::with_name("dec-interval")
                .short("A")
                .long("dec-interval")
                .value_name("USEC")
                .takes_value(true)
                .help("Decrementor send interval in microseconds [default: 1000]"),
        )
        .arg(
            Arg::with_name("dec-amount")
                .short("B")
                .long("dec-amount")
                .value_name("NUM")
                .takes_value(true)
                .help("Load decrement per DEC packet [default: 1]"),
        )
        .get_matches();

    if matches.value_of("transport").unwrap_or("udp") == "dpdk" {
        fatal("the dpdk transport is not available in this build; use --transport udp");
    }

    let config: Arc<Config> = match Config::load(matches.value_of("config").unwrap()) {
        Ok(config) => Arc::new(config),
        Err(err) => fatal(&format!("{err}")),
    };

    let protocol = matches.value_of("protocol").unwrap_or("static");
    let codec: Arc<dyn MessageCodec> = match protocol {
        "router" => Arc::new(SteerCodec::new(true)),
        "netcache" => Arc::new(InlineCodec::new()),
        _ => Arc::new(SteerCodec::new(false)),
    };
    let use_lb = protocol == "router";
    let num_threads: usize = parse_arg(&matches, "threads", 1);
    let exit_flag = Arc::new(AtomicBool::new(false));

    match matches.value_of("role").unwrap() {
        "server" => {
            let rack_id: usize = parse_arg(&matches, "rack-id", usize::MAX);
            let node_id: usize = parse_arg(&matches, "node-id", usize::MAX);
            if rack_id >= config.num_racks() || node_id >= config.num_nodes() {
                fatal("server requires valid --rack-id and --node-id");
            }
            let store = match matches.value_of("keys-file") {
                Some(path) => {
                    let nkeys = parse_arg(&matches, "num-keys", 1000);
                    let value_len: usize = parse_arg(&matches, "value-len", 256);
                    let keys = read_keys(path, nkeys);
                    Store::preloaded(
                        keys.iter().map(String::as_str),
                        &vec![b'v'; value_len],
                    )
                }
                None => Store::new(),
            };
            let entry = config.node(rack_id, node_id);
            let sock = bind_to(entry.port, false)
                .unwrap_or_else(|err| fatal(&format!("failed to bind {}: {err}", entry.port)));
            info!(
                "server rack {rack_id} node {node_id} serving on {}",
                sock.local_addr().unwrap()
            );
            let node = Arc::new(ServerNode::new(
                config,
                rack_id,
                node_id as NodeId,
                Arc::new(store),
                codec,
                use_lb,
            ));
            ServerService::new(node, sock, num_threads, exit_flag)
                .join()
                .unwrap();
        }
        "lb" => {
            let entry = config
                .lb
                .unwrap_or_else(|| fatal("configuration has no lb entry"));
            let sock = bind_to(entry.port, false)
                .unwrap_or_else(|err| fatal(&format!("failed to bind {}: {err}", entry.port)));
            info!("coordinator serving on {}", sock.local_addr().unwrap());
            let tuning = FabricTuning {
                max_rset_size: parse_arg(&matches, "num-rkeys", 32),
                ..FabricTuning::default()
            };
            let fabric = Arc::new(Fabric::with_tuning(
                config.num_nodes() as NodeId,
                tuning,
            ));
            let seed_sock = Arc::new(
                UdpSocket::bind("0.0.0.0:0")
                    .unwrap_or_else(|err| fatal(&format!("failed to bind seed socket: {err}"))),
            );
            let (seed_sender, seed_receiver) = unbounded();
            let t_seeder = promotion::seed_forwarder(
                config.clone(),
                seed_sock,
                seed_receiver,
                exit_flag.clone(),
            );
            let promotion =
                PromotionService::new(fabric.clone(), seed_sender, exit_flag.clone());
            let coordinator =
                CoordinatorService::new(fabric, config, sock, num_threads, exit_flag);
            coordinator.join().unwrap();
            promotion.join().unwrap();
            t_seeder.join().unwrap();
        }
        "client" => {
            let client_id: usize = parse_arg(&matches, "node-id", usize::MAX);
            if client_id >= config.clients.len() {
                fatal("client requires a valid --node-id");
            }
            let keys_file = matches
                .value_of("keys-file")
                .unwrap_or_else(|| fatal("client requires --keys-file"));
            let keys = read_keys(keys_file, parse_arg(&matches, "num-keys", 1000));
            let workload = WorkloadConfig {
                value_len: parse_arg(&matches, "value-len", 256),
                get_ratio: parse_arg(&matches, "get-ratio", 0.5),
                put_ratio: parse_arg(&matches, "put-ratio", 0.5),
                mean_interval: Duration::from_micros(parse_arg(&matches, "interval", 1000)),
                alpha: parse_arg(&matches, "alpha", 0.5),
                key_dist: match matches.value_of("key-dist").unwrap_or("unif") {
                    "zipf" => KeyDist::Zipf,
                    _ => KeyDist::Uniform,
                },
                dynamism: match matches.value_of("dynamism").unwrap_or("none") {
                    "hotin" => Dynamism::HotIn,
                    "random" => Dynamism::Random,
                    _ => Dynamism::None,
                },
                d_interval: Duration::from_secs(parse_arg(&matches, "d-interval", 1)),
                d_nkeys: parse_arg(&matches, "d-nkeys", 100),
            };
            if use_lb && config.lb.is_none() {
                fatal("configuration has no lb entry");
            }
            let entry = config.client(client_id);
            let sock = bind_to(entry.port, false)
                .unwrap_or_else(|err| fatal(&format!("failed to bind {}: {err}", entry.port)));
            let route = if use_lb {
                RouteMode::Coordinator
            } else {
                RouteMode::Static
            };
            let stats = Arc::new(LatencyStats::new());
            let duration = Duration::from_secs(parse_arg(&matches, "duration", 5));
            if let Err(err) = client::run_workload(
                config,
                client_id as NodeId,
                codec,
                Arc::new(WorkloadGenerator::new(keys, workload)),
                route,
                duration,
                num_threads,
                stats.clone(),
                sock,
            ) {
                fatal(&format!("workload failed: {err}"));
            }
            let summary = stats
                .dump(matches.value_of("stats-file").map(Path::new))
                .unwrap_or_else(|err| fatal(&format!("failed to dump stats: {err}")));
            println!(
                "throughput: {} ops/s, median latency: {}us, 99th: {}us",
                summary.throughput, summary.median_latency_us, summary.p99_latency_us
            );
        }
        "controller" => {
            let targets: Vec<_> = if config.controllers.is_empty() {
                config.lb.iter().map(|entry| entry.addr()).collect()
            } else {
                config.controllers.iter().map(|entry| entry.addr()).collect()
            };
            if targets.is_empty() {
                fatal("configuration has no controller or lb endpoints");
            }
            let sock = UdpSocket::bind("0.0.0.0:0")
                .unwrap_or_else(|err| fatal(&format!("failed to bind: {err}")));
            let acked = controller::run_reset(
                &sock,
                &targets,
                config.num_nodes() as u16,
                parse_arg(&matches, "num-rkeys", 32),
                Duration::from_secs(2),
            )
            .unwrap_or_else(|err| fatal(&format!("reset failed: {err}")));
            info!("reset acked: {acked}");
        }
        "decrementor" => {
            if config.lb.is_none() {
                fatal("decrementor requires an lb entry in the configuration");
            }
            let sock = UdpSocket::bind("0.0.0.0:0")
                .unwrap_or_else(|err| fatal(&format!("failed to bind: {err}")));
            let interval = Duration::from_micros(parse_arg(&matches, "dec-interval", 1000));
            let amount = parse_arg(&matches, "dec-amount", 1);
            DecrementorService::new(config, sock, interval, amount, exit_flag)
                .join()
                .unwrap();
        }
        _ => unreachable!(),
    }
}
