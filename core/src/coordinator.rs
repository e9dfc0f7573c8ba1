//! The `coordinator` module implements the data plane that sits between
//! clients and servers: parse the steering header, let the fabric pick a
//! destination and stamp versions, rewrite the packet in place, and forward.
//! The raw path works on whole Ethernet frames (the NIC deployment); the UDP
//! service applies the same pipeline to socket datagrams for emulation.

use {
    crate::{
        config::{Config, NodeEntry},
        fabric::{Fabric, Steer, SteerHeader},
        packet::PacketBatch,
        result::Result,
        service::Service,
        streamer::{self, PacketBatchReceiver},
        wire::{IDENT_REPLICATED, OP_DEL, OP_GET, OP_PUT, PACKET_BASE_SIZE},
    },
    crossbeam_channel::unbounded,
    log::{debug, trace},
    skimmer_metrics::{inc_new_counter_debug, inc_new_counter_info},
    std::{
        net::{SocketAddr, UdpSocket},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, Builder, JoinHandle},
        time::Duration,
    },
};

pub const ETHER_HDR_LEN: usize = 14;
pub const IPV4_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;
/// Offset of the application payload within a raw frame.
pub const FRAME_HDR_LEN: usize = ETHER_HDR_LEN + IPV4_HDR_LEN + UDP_HDR_LEN;

/// Parse the steering header off an application payload. `None` means the
/// packet is not ours and is silently dropped.
pub fn parse_steer_header(payload: &[u8]) -> Option<SteerHeader> {
    if payload.len() < PACKET_BASE_SIZE {
        return None;
    }
    if u16::from_be_bytes([payload[0], payload[1]]) != IDENT_REPLICATED {
        return None;
    }
    Some(SteerHeader {
        op: payload[2],
        keyhash: u32::from_be_bytes([payload[3], payload[4], payload[5], payload[6]]),
        client_id: payload[7],
        server_id: payload[8],
        load: u16::from_be_bytes([payload[9], payload[10]]),
        ver: u32::from_be_bytes([payload[11], payload[12], payload[13], payload[14]]),
    })
}

/// Write the mutable header fields back into the payload. The identifier and
/// membership bitmap are left as received.
pub fn write_steer_header(payload: &mut [u8], header: &SteerHeader) {
    payload[2] = header.op;
    payload[3..7].copy_from_slice(&header.keyhash.to_be_bytes());
    payload[7] = header.client_id;
    payload[8] = header.server_id;
    payload[9..11].copy_from_slice(&header.load.to_be_bytes());
    payload[11..15].copy_from_slice(&header.ver.to_be_bytes());
}

/// Borrow the key bytes of a request payload, if the packet carries one.
/// Only consulted on sampled accesses that may seed replication.
pub fn request_key(payload: &[u8]) -> Option<&str> {
    const KEY_LEN_OFFSET: usize = PACKET_BASE_SIZE + 4 + 4 + 1;
    if payload.len() < PACKET_BASE_SIZE {
        return None;
    }
    let op = payload[2];
    if !matches!(op, OP_GET | OP_PUT | OP_DEL) {
        return None;
    }
    let len_bytes = payload.get(KEY_LEN_OFFSET..KEY_LEN_OFFSET + 2)?;
    let key_len = usize::from(u16::from_be_bytes([len_bytes[0], len_bytes[1]]));
    let key = payload.get(KEY_LEN_OFFSET + 2..KEY_LEN_OFFSET + 2 + key_len)?;
    std::str::from_utf8(key).ok()
}

/// 16-bit one's-complement sum over the IPv4 header.
fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for word in header.chunks(2) {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }
    !(sum as u16)
}

/// Rewrite L2/L3/L4 addressing for a forwarded frame: our addresses as the
/// source, the destination entry's as the target. The UDP source port is
/// preserved so receive-side scaling can hash on the sender's random port;
/// the UDP checksum is disabled fabric-wide.
fn rewrite_frame_addresses(frame: &mut [u8], own: &NodeEntry, dst: &NodeEntry) {
    frame[0..6].copy_from_slice(&dst.mac);
    frame[6..12].copy_from_slice(&own.mac);
    let ip = &mut frame[ETHER_HDR_LEN..ETHER_HDR_LEN + IPV4_HDR_LEN];
    ip[12..16].copy_from_slice(&own.ip.octets());
    ip[16..20].copy_from_slice(&dst.ip.octets());
    ip[10..12].copy_from_slice(&[0, 0]);
    let check = ipv4_checksum(&frame[ETHER_HDR_LEN..ETHER_HDR_LEN + IPV4_HDR_LEN]);
    frame[ETHER_HDR_LEN + 10..ETHER_HDR_LEN + 12].copy_from_slice(&check.to_be_bytes());
    let udp = &mut frame[ETHER_HDR_LEN + IPV4_HDR_LEN..FRAME_HDR_LEN];
    udp[2..4].copy_from_slice(&dst.port.to_be_bytes());
    udp[6..8].copy_from_slice(&[0, 0]);
}

/// Run one received frame through the pipeline, mutating it in place.
/// Returns the rewritten frame's destination, or `None` to drop.
pub fn process_frame(fabric: &Fabric, config: &Config, frame: &mut [u8]) -> Option<SocketAddr> {
    if frame.len() < FRAME_HDR_LEN + PACKET_BASE_SIZE {
        return None;
    }
    let payload = &frame[FRAME_HDR_LEN..];
    let mut header = parse_steer_header(payload)?;
    let key = request_key(payload).map(str::to_string);
    let dst = match fabric.steer(&mut header, key.as_deref()) {
        Steer::ToServer(id) => {
            if usize::from(id) >= config.num_nodes() {
                return None;
            }
            *config.node(0, usize::from(id))
        }
        Steer::ToClient(id) => {
            if usize::from(id) >= config.clients.len() {
                return None;
            }
            *config.client(usize::from(id))
        }
        Steer::Drop => return None,
    };
    write_steer_header(&mut frame[FRAME_HDR_LEN..], &header);
    let own = config.lb.expect("coordinator requires an lb entry");
    rewrite_frame_addresses(frame, &own, &dst);
    Some(dst.addr())
}

/// Compose a raw frame around an application payload, the shape the raw
/// transport hands the data plane.
pub fn compose_frame(src: &NodeEntry, dst: &NodeEntry, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; FRAME_HDR_LEN + payload.len()];
    frame[0..6].copy_from_slice(&dst.mac);
    frame[6..12].copy_from_slice(&src.mac);
    frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
    let total_len = (IPV4_HDR_LEN + UDP_HDR_LEN + payload.len()) as u16;
    {
        let ip = &mut frame[ETHER_HDR_LEN..ETHER_HDR_LEN + IPV4_HDR_LEN];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip[8] = 64; // ttl
        ip[9] = 17; // udp
        ip[12..16].copy_from_slice(&src.ip.octets());
        ip[16..20].copy_from_slice(&dst.ip.octets());
    }
    let check = ipv4_checksum(&frame[ETHER_HDR_LEN..ETHER_HDR_LEN + IPV4_HDR_LEN]);
    frame[ETHER_HDR_LEN + 10..ETHER_HDR_LEN + 12].copy_from_slice(&check.to_be_bytes());
    {
        let udp = &mut frame[ETHER_HDR_LEN + IPV4_HDR_LEN..FRAME_HDR_LEN];
        udp[0..2].copy_from_slice(&src.port.to_be_bytes());
        udp[2..4].copy_from_slice(&dst.port.to_be_bytes());
        udp[4..6].copy_from_slice(&((UDP_HDR_LEN + payload.len()) as u16).to_be_bytes());
    }
    frame[FRAME_HDR_LEN..].copy_from_slice(payload);
    frame
}

fn steer_batch(
    fabric: &Fabric,
    config: &Config,
    batch: &mut PacketBatch,
    responder: &crossbeam_channel::Sender<(Vec<u8>, SocketAddr)>,
) -> Result<()> {
    for packet in batch.iter_mut() {
        let size = packet.meta.size;
        let payload = &packet.data[..size];
        let mut header = match parse_steer_header(payload) {
            Some(header) => header,
            None => {
                inc_new_counter_debug!("coordinator-not_ours", 1);
                continue;
            }
        };
        let key = request_key(payload).map(str::to_string);
        let dst = match fabric.steer(&mut header, key.as_deref()) {
            Steer::ToServer(id) if usize::from(id) < config.num_nodes() => {
                config.node(0, usize::from(id)).addr()
            }
            Steer::ToClient(id) if usize::from(id) < config.clients.len() => {
                config.client(usize::from(id)).addr()
            }
            _ => continue,
        };
        write_steer_header(&mut packet.data[..size], &header);
        trace!("steer op {:#x} -> {}", header.op, dst);
        responder.send((packet.data[..size].to_vec(), dst))?;
    }
    Ok(())
}

/// The UDP-mode coordinator: streamer receiver in, worker threads steering,
/// responder out.
pub struct CoordinatorService {
    thread_hdls: Vec<JoinHandle<()>>,
}

impl CoordinatorService {
    pub fn new(
        fabric: Arc<Fabric>,
        config: Arc<Config>,
        sock: UdpSocket,
        num_workers: usize,
        exit: Arc<AtomicBool>,
    ) -> Self {
        let sock = Arc::new(sock);
        let (packet_sender, packet_receiver) = unbounded();
        let (response_sender, response_receiver) = unbounded();
        let mut thread_hdls = vec![streamer::receiver(
            sock.clone(),
            exit.clone(),
            packet_sender,
            "coordinator",
        )];
        for i in 0..num_workers.max(1) {
            thread_hdls.push(Self::worker(
                i,
                fabric.clone(),
                config.clone(),
                packet_receiver.clone(),
                response_sender.clone(),
                exit.clone(),
            ));
        }
        drop(response_sender);
        thread_hdls.push(streamer::responder("coordinator", sock, response_receiver));
        CoordinatorService { thread_hdls }
    }

    fn worker(
        id: usize,
        fabric: Arc<Fabric>,
        config: Arc<Config>,
        receiver: PacketBatchReceiver,
        responder: crossbeam_channel::Sender<(Vec<u8>, SocketAddr)>,
        exit: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        Builder::new()
            .name(format!("skmr-steer-{id}"))
            .spawn(move || loop {
                if exit.load(Ordering::Relaxed) {
                    break;
                }
                let mut batch = match receiver.recv_timeout(Duration::from_millis(200)) {
                    Ok(batch) => batch,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                };
                inc_new_counter_info!("coordinator-packets", batch.len(), 1000);
                if steer_batch(&fabric, &config, &mut batch, &responder).is_err() {
                    debug!("coordinator responder disconnected");
                    break;
                }
            })
            .unwrap()
    }
}

impl Service for CoordinatorService {
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

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            config::Config,
            wire::{
                compute_keyhash, KvMessage, KvOperation, KvRequest, MessageCodec, OpKind,
                SteerCodec, BASE_VERSION, OP_DEC, OP_PUT,
            },
        },
        std::net::Ipv4Addr,
    };

    fn test_config() -> Config {
        "\
rack
node 02:00:00:00:00:01|10.0.0.1|5001
node 02:00:00:00:00:02|10.0.0.2|5001
node 02:00:00:00:00:03|10.0.0.3|5001
node 02:00:00:00:00:04|10.0.0.4|5001
client 02:00:00:00:01:01|10.0.1.1|6001
lb 02:00:00:00:02:01|10.0.2.1|7001
"
        .parse()
        .unwrap()
    }

    fn encoded_request(op: OpKind, key: &str, server_id: u8) -> Vec<u8> {
        SteerCodec::new(true)
            .encode(&KvMessage::Request(KvRequest {
                client_id: 0,
                server_id,
                req_id: 1,
                req_time: 2,
                op: KvOperation {
                    op,
                    keyhash: compute_keyhash(key),
                    ver: BASE_VERSION,
                    key: key.to_string(),
                    value: if op.is_write() { b"v".to_vec() } else { Vec::new() },
                },
            }))
            .unwrap()
    }

    #[test]
    fn test_header_round_trip() {
        let mut payload = encoded_request(OpKind::Get, "k", 3);
        let mut header = parse_steer_header(&payload).unwrap();
        assert_eq!(header.op, 0);
        assert_eq!(header.keyhash, compute_keyhash("k"));
        assert_eq!(header.server_id, 3);
        header.server_id = 1;
        header.ver = 77;
        write_steer_header(&mut payload, &header);
        let reparsed = parse_steer_header(&payload).unwrap();
        assert_eq!(reparsed, header);
    }

    #[test]
    fn test_request_key_extraction() {
        let payload = encoded_request(OpKind::Put, "mykey", 0);
        assert_eq!(request_key(&payload), Some("mykey"));
        let mut dec = payload.clone();
        dec[2] = OP_DEC;
        assert_eq!(request_key(&dec), None);
    }

    #[test]
    fn test_ipv4_checksum_reference_vector() {
        // example header from RFC 1071 style worked examples
        let header: [u8; 20] = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0,
            0xa8, 0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(ipv4_checksum(&header), 0xb861);
    }

    #[test]
    fn test_process_frame_steers_write() {
        let config = test_config();
        let fabric = Fabric::new(4);
        let client = config.client(0);
        let lb = config.lb.unwrap();
        let payload = encoded_request(OpKind::Put, "k", 2);
        let mut frame = compose_frame(client, &lb, &payload);
        let src_port_before = frame[ETHER_HDR_LEN + IPV4_HDR_LEN..][..2].to_vec();

        let dst = process_frame(&fabric, &config, &mut frame).unwrap();
        assert_eq!(dst, config.node(0, 2).addr());

        // version got stamped
        let header = parse_steer_header(&frame[FRAME_HDR_LEN..]).unwrap();
        assert_eq!(header.ver, 1);
        // L2/L3 rewritten to coordinator -> server
        assert_eq!(&frame[0..6], &config.node(0, 2).mac);
        assert_eq!(&frame[6..12], &lb.mac);
        assert_eq!(
            &frame[ETHER_HDR_LEN + 12..ETHER_HDR_LEN + 16],
            &lb.ip.octets()
        );
        // UDP source port preserved, checksum zeroed
        assert_eq!(&frame[ETHER_HDR_LEN + IPV4_HDR_LEN..][..2], &src_port_before[..]);
        assert_eq!(&frame[ETHER_HDR_LEN + IPV4_HDR_LEN + 6..][..2], &[0, 0]);
        // IPv4 header checksum verifies: summing the header with its
        // checksum in place yields all ones
        let ip = &frame[ETHER_HDR_LEN..ETHER_HDR_LEN + IPV4_HDR_LEN];
        let mut sum = 0u32;
        for word in ip.chunks(2) {
            sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
        }
        while sum >> 16 != 0 {
            sum = (sum >> 16) + (sum & 0xFFFF);
        }
        assert_eq!(sum, 0xFFFF);
    }

    #[test]
    fn test_process_frame_drops_foreign_and_runts() {
        let config = test_config();
        let fabric = Fabric::new(4);
        let client = config.client(0);
        let lb = config.lb.unwrap();

        let mut runt = compose_frame(client, &lb, &[0u8; 4]);
        assert_eq!(process_frame(&fabric, &config, &mut runt), None);

        let mut foreign = compose_frame(client, &lb, &[0xAAu8; PACKET_BASE_SIZE]);
        assert_eq!(process_frame(&fabric, &config, &mut foreign), None);

        let mut payload = encoded_request(OpKind::Get, "k", 0);
        payload[2] = OP_DEC;
        let mut dec = compose_frame(client, &lb, &payload);
        assert_eq!(process_frame(&fabric, &config, &mut dec), None);
    }

    #[test]
    fn test_process_frame_replicated_get_goes_to_member() {
        let config = test_config();
        let fabric = Fabric::new(4);
        let keyhash = compute_keyhash("hot");
        fabric.promote(keyhash).unwrap();
        let home = fabric.home(keyhash);

        let client = config.client(0);
        let lb = config.lb.unwrap();
        // client aimed at server 3, coordinator re-steers to the replica set
        let payload = encoded_request(OpKind::Get, "hot", 3);
        let mut frame = compose_frame(client, &lb, &payload);
        let dst = process_frame(&fabric, &config, &mut frame).unwrap();
        assert_eq!(dst, config.node(0, usize::from(home)).addr());
        assert_eq!(
            Ipv4Addr::from(<[u8; 4]>::try_from(&frame[ETHER_HDR_LEN + 16..ETHER_HDR_LEN + 20]).unwrap()),
            config.node(0, usize::from(home)).ip
        );
    }

    #[test]
    fn test_reply_frame_returns_to_client() {
        let config = test_config();
        let fabric = Fabric::new(4);
        let server = config.node(0, 1);
        let lb = config.lb.unwrap();
        let reply = crate::wire::KvReply {
            client_id: 0,
            server_id: 1,
            keyhash: compute_keyhash("k"),
            load: 0,
            ver: 5,
            req_id: 1,
            req_time: 2,
            op: OpKind::Put,
            result: crate::wire::OpResult::Ok,
            key: String::new(),
            value: Vec::new(),
        };
        let payload = SteerCodec::new(true)
            .encode(&KvMessage::Reply(reply))
            .unwrap();
        assert_eq!(payload[2], crate::wire::OP_REP_W);
        let mut frame = compose_frame(server, &lb, &payload);
        let dst = process_frame(&fabric, &config, &mut frame).unwrap();
        assert_eq!(dst, config.client(0).addr());
    }

    #[test]
    fn test_put_header_op_matches_wire_op() {
        let payload = encoded_request(OpKind::Put, "k", 0);
        assert_eq!(payload[2], OP_PUT);
    }
}
