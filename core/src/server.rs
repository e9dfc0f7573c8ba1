//! The `server` module implements the back-end store node: the request
//! pipeline with versioned writes, chain forwarding of writes to the next
//! rack, and the rack-local replication seed that materializes new replicas
//! of a promoted key.

use {
    crate::{
        config::Config,
        packet::PacketBatch,
        result::Result,
        service::Service,
        store::Store,
        streamer::{self, PacketBatchReceiver, ResponseSender},
        wire::{
            ControlCodec, ControlMessage, KvMessage, KvReply, KvRequest, MessageCodec, NodeId,
            OpKind, OpResult, RcAck, RcRequest, BASE_VERSION,
        },
    },
    crossbeam_channel::unbounded,
    log::{debug, trace, warn},
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

/// One store node's identity and shared state. The request pipeline is a
/// pure function from a datagram to the datagrams it emits, so worker
/// threads and tests drive it the same way.
pub struct ServerNode {
    config: Arc<Config>,
    rack_id: usize,
    node_id: NodeId,
    store: Arc<Store>,
    codec: Arc<dyn MessageCodec>,
    ctrl_codec: ControlCodec,
    /// Route replies through the coordinator instead of straight back to
    /// the client.
    use_lb: bool,
}

impl ServerNode {
    pub fn new(
        config: Arc<Config>,
        rack_id: usize,
        node_id: NodeId,
        store: Arc<Store>,
        codec: Arc<dyn MessageCodec>,
        use_lb: bool,
    ) -> Self {
        ServerNode {
            config,
            rack_id,
            node_id,
            store,
            codec,
            ctrl_codec: ControlCodec::new(),
            use_lb,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn is_tail(&self) -> bool {
        self.rack_id == self.config.num_racks() - 1
    }

    /// Process one received datagram, returning the datagrams to transmit.
    pub fn handle_datagram(&self, payload: &[u8]) -> Vec<(Vec<u8>, SocketAddr)> {
        if let Ok(ctrl) = self.ctrl_codec.decode(payload) {
            return self.handle_control(ctrl);
        }
        match self.codec.decode(payload) {
            Ok(KvMessage::Request(request)) => self.handle_request(request),
            Ok(KvMessage::RcRequest(push)) => self.handle_replica_push(push),
            Ok(message) => {
                trace!("ignoring unexpected message {message:?}");
                inc_new_counter_debug!("server-unexpected_message", 1);
                Vec::new()
            }
            Err(err) => {
                trace!("dropping undecodable datagram: {err}");
                inc_new_counter_debug!("server-decode_error", 1);
                Vec::new()
            }
        }
    }

    fn handle_control(&self, ctrl: ControlMessage) -> Vec<(Vec<u8>, SocketAddr)> {
        match ctrl {
            ControlMessage::Replication { keyhash, key } => self.seed_replicas(keyhash, &key),
            other => {
                debug!("ignoring control message {other:?}");
                Vec::new()
            }
        }
    }

    /// Seed push: send our copy of the key to every other node in the rack.
    fn seed_replicas(&self, keyhash: u32, key: &str) -> Vec<(Vec<u8>, SocketAddr)> {
        let item = match self.store.get(key) {
            Some(item) => item,
            None => {
                debug!("replication seed for absent key {keyhash:#x}");
                return Vec::new();
            }
        };
        let push = KvMessage::RcRequest(RcRequest {
            keyhash,
            ver: item.ver,
            key: key.to_string(),
            value: item.value,
        });
        let buf = match self.codec.encode(&push) {
            Ok(buf) => buf,
            Err(err) => {
                warn!("failed to encode replica push: {err}");
                return Vec::new();
            }
        };
        inc_new_counter_info!("server-replica_seeds", 1);
        (0..self.config.num_nodes())
            .filter(|id| *id != usize::from(self.node_id))
            .map(|id| (buf.clone(), self.config.node(self.rack_id, id).addr()))
            .collect()
    }

    /// Apply a peer's replica push under the version rule; acknowledge to
    /// the coordinator only if our copy advanced. Silence is the only retry
    /// signal.
    fn handle_replica_push(&self, push: RcRequest) -> Vec<(Vec<u8>, SocketAddr)> {
        if !self.store.put(&push.key, push.ver, &push.value) {
            return Vec::new();
        }
        let lb = match self.config.lb {
            Some(lb) => lb,
            None => return Vec::new(),
        };
        let ack = KvMessage::RcAck(RcAck {
            keyhash: push.keyhash,
            ver: push.ver,
            server_id: self.node_id,
        });
        match self.codec.encode(&ack) {
            Ok(buf) => vec![(buf, lb.addr())],
            Err(err) => {
                warn!("failed to encode replica ack: {err}");
                Vec::new()
            }
        }
    }

    fn handle_request(&self, request: KvRequest) -> Vec<(Vec<u8>, SocketAddr)> {
        let reply = self.execute(&request);
        // Chain replication: the tail rack answers; earlier racks pass the
        // write along to their same-numbered peer in the next rack.
        if !self.is_tail() && request.op.op.is_write() {
            let mut forward = request;
            forward.op.op = OpKind::PutFwd;
            return match self.codec.encode(&KvMessage::Request(forward)) {
                Ok(buf) => {
                    let next = self
                        .config
                        .node(self.rack_id + 1, usize::from(self.node_id))
                        .addr();
                    vec![(buf, next)]
                }
                Err(err) => {
                    warn!("failed to encode chain forward: {err}");
                    Vec::new()
                }
            };
        }
        let dst = if self.use_lb {
            match self.config.lb {
                Some(lb) => lb.addr(),
                None => {
                    warn!("no coordinator configured for reply routing");
                    return Vec::new();
                }
            }
        } else if usize::from(reply.client_id) < self.config.clients.len() {
            self.config.client(usize::from(reply.client_id)).addr()
        } else {
            inc_new_counter_debug!("server-unknown_client", 1);
            return Vec::new();
        };
        match self.codec.encode(&KvMessage::Reply(reply)) {
            Ok(buf) => vec![(buf, dst)],
            Err(err) => {
                warn!("failed to encode reply: {err}");
                Vec::new()
            }
        }
    }

    fn execute(&self, request: &KvRequest) -> KvReply {
        let op = &request.op;
        let mut reply = KvReply {
            client_id: request.client_id,
            server_id: self.node_id,
            keyhash: op.keyhash,
            load: 0,
            ver: op.ver,
            req_id: request.req_id,
            req_time: request.req_time,
            op: op.op,
            result: OpResult::Ok,
            key: op.key.clone(),
            value: Vec::new(),
        };
        match op.op {
            OpKind::Get => match self.store.get(&op.key) {
                Some(item) => {
                    reply.ver = item.ver;
                    reply.value = item.value;
                }
                None => {
                    reply.ver = BASE_VERSION;
                    reply.result = OpResult::NotFound;
                }
            },
            OpKind::Put | OpKind::PutFwd => {
                self.store.put(&op.key, op.ver, &op.value);
                // the reply carries the incoming version even when the
                // store kept a fresher copy
                reply.value = op.value.clone();
                // clients never see the chain-forwarded flavor
                reply.op = OpKind::Put;
            }
            OpKind::Del => {
                self.store.del(&op.key, op.ver);
            }
        }
        reply
    }
}

/// Threaded wrapper: streamer receiver in, request workers, responder out.
pub struct ServerService {
    thread_hdls: Vec<JoinHandle<()>>,
}

impl ServerService {
    pub fn new(
        node: Arc<ServerNode>,
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
            "server",
        )];
        for i in 0..num_workers.max(1) {
            thread_hdls.push(Self::worker(
                i,
                node.clone(),
                packet_receiver.clone(),
                response_sender.clone(),
                exit.clone(),
            ));
        }
        drop(response_sender);
        thread_hdls.push(streamer::responder("server", sock, response_receiver));
        ServerService { thread_hdls }
    }

    fn worker(
        id: usize,
        node: Arc<ServerNode>,
        receiver: PacketBatchReceiver,
        responder: ResponseSender,
        exit: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        Builder::new()
            .name(format!("skmr-server-{id}"))
            .spawn(move || loop {
                if exit.load(Ordering::Relaxed) {
                    break;
                }
                let batch: PacketBatch =
                    match receiver.recv_timeout(Duration::from_millis(200)) {
                        Ok(batch) => batch,
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    };
                inc_new_counter_info!("server-requests", batch.len(), 1000);
                if Self::process_batch(&node, &batch, &responder).is_err() {
                    break;
                }
            })
            .unwrap()
    }

    fn process_batch(
        node: &ServerNode,
        batch: &PacketBatch,
        responder: &ResponseSender,
    ) -> Result<()> {
        for packet in batch {
            for out in node.handle_datagram(packet.payload()) {
                responder.send(out)?;
            }
        }
        Ok(())
    }
}

impl Service for ServerService {
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
        crate::wire::{compute_keyhash, KvOperation, SteerCodec},
    };

    fn test_config(racks: usize) -> Arc<Config> {
        let mut text = String::new();
        for rack in 0..racks {
            text.push_str("rack\n");
            for node in 0..3 {
                text.push_str(&format!(
                    "node 02:00:00:00:{rack:02x}:{:02x}|10.0.{rack}.{}|5001\n",
                    node + 1,
                    node + 1,
                ));
            }
        }
        text.push_str("client 02:00:00:00:10:01|10.0.10.1|6001\n");
        text.push_str("lb 02:00:00:00:20:01|10.0.20.1|7001\n");
        Arc::new(text.parse().unwrap())
    }

    fn test_node(config: Arc<Config>, rack_id: usize, node_id: NodeId) -> ServerNode {
        ServerNode::new(
            config,
            rack_id,
            node_id,
            Arc::new(Store::new()),
            Arc::new(SteerCodec::new(true)),
            false,
        )
    }

    fn request(op: OpKind, key: &str, value: &[u8], ver: u32) -> Vec<u8> {
        SteerCodec::new(true)
            .encode(&KvMessage::Request(KvRequest {
                client_id: 0,
                server_id: 0,
                req_id: 9,
                req_time: 100,
                op: KvOperation {
                    op,
                    keyhash: compute_keyhash(key),
                    ver,
                    key: key.to_string(),
                    value: value.to_vec(),
                },
            }))
            .unwrap()
    }

    fn decode_reply(node: &ServerNode, out: &[(Vec<u8>, SocketAddr)]) -> KvReply {
        assert_eq!(out.len(), 1);
        match node.codec.decode(&out[0].0).unwrap() {
            KvMessage::Reply(reply) => reply,
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn test_write_then_read() {
        let node = test_node(test_config(1), 0, 1);
        let out = node.handle_datagram(&request(OpKind::Put, "x", b"y", 1));
        let reply = decode_reply(&node, &out);
        assert_eq!(reply.result, OpResult::Ok);
        assert_eq!(reply.ver, 1);
        assert_eq!(out[0].1, node.config.client(0).addr());

        let out = node.handle_datagram(&request(OpKind::Get, "x", b"", 0));
        let reply = decode_reply(&node, &out);
        assert_eq!(reply.result, OpResult::Ok);
        assert_eq!(reply.ver, 1);
        assert_eq!(reply.value, b"y");
    }

    #[test]
    fn test_get_miss() {
        let node = test_node(test_config(1), 0, 0);
        let out = node.handle_datagram(&request(OpKind::Get, "nothing", b"", 0));
        let reply = decode_reply(&node, &out);
        assert_eq!(reply.result, OpResult::NotFound);
        assert_eq!(reply.ver, BASE_VERSION);
        assert!(reply.value.is_empty());
    }

    #[test]
    fn test_stale_write_leaves_store_reports_incoming_version() {
        let node = test_node(test_config(1), 0, 0);
        node.store().put("k", 5, b"a");
        let out = node.handle_datagram(&request(OpKind::Put, "k", b"b", 3));
        let reply = decode_reply(&node, &out);
        assert_eq!(reply.result, OpResult::Ok);
        assert_eq!(reply.ver, 3);
        let item = node.store().get("k").unwrap();
        assert_eq!(item.ver, 5);
        assert_eq!(item.value, b"a");
    }

    #[test]
    fn test_versioned_delete() {
        let node = test_node(test_config(1), 0, 0);
        node.store().put("k", 5, b"a");
        let out = node.handle_datagram(&request(OpKind::Del, "k", b"", 7));
        let reply = decode_reply(&node, &out);
        assert_eq!(reply.ver, 7);
        assert!(node.store().get("k").is_none());
    }

    #[test]
    fn test_forwarded_write_reply_looks_direct() {
        let node = test_node(test_config(1), 0, 0);
        let out = node.handle_datagram(&request(OpKind::PutFwd, "k", b"v", 4));
        let reply = decode_reply(&node, &out);
        assert_eq!(reply.op, OpKind::Put);
        assert_eq!(reply.ver, 4);
        assert_eq!(node.store().get("k").unwrap().ver, 4);
    }

    #[test]
    fn test_chain_forwards_writes_to_next_rack() {
        let config = test_config(2);
        let node = test_node(config.clone(), 0, 1);
        let out = node.handle_datagram(&request(OpKind::Put, "k", b"v", 6));
        // applied locally, then passed down the chain instead of replied
        assert_eq!(node.store().get("k").unwrap().ver, 6);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, config.node(1, 1).addr());
        match node.codec.decode(&out[0].0).unwrap() {
            KvMessage::Request(fwd) => {
                assert_eq!(fwd.op.op, OpKind::PutFwd);
                assert_eq!(fwd.op.ver, 6);
                assert_eq!(fwd.op.key, "k");
            }
            other => panic!("expected forwarded request, got {other:?}"),
        }
    }

    #[test]
    fn test_chain_answers_reads_in_place() {
        let node = test_node(test_config(2), 0, 1);
        node.store().put("k", 2, b"v");
        let out = node.handle_datagram(&request(OpKind::Get, "k", b"", 0));
        let reply = decode_reply(&node, &out);
        assert_eq!(reply.value, b"v");
    }

    #[test]
    fn test_seed_fans_out_to_rack_peers() {
        let config = test_config(1);
        let node = test_node(config.clone(), 0, 1);
        node.store().put("hot", 3, b"w");
        let seed = ControlCodec::new()
            .encode(&ControlMessage::Replication {
                keyhash: compute_keyhash("hot"),
                key: "hot".to_string(),
            })
            .unwrap();
        let out = node.handle_datagram(&seed);
        assert_eq!(out.len(), 2);
        let dsts: Vec<SocketAddr> = out.iter().map(|(_, dst)| *dst).collect();
        assert!(dsts.contains(&config.node(0, 0).addr()));
        assert!(dsts.contains(&config.node(0, 2).addr()));
        match node.codec.decode(&out[0].0).unwrap() {
            KvMessage::RcRequest(push) => {
                assert_eq!(push.key, "hot");
                assert_eq!(push.ver, 3);
                assert_eq!(push.value, b"w");
            }
            other => panic!("expected replica push, got {other:?}"),
        }
    }

    #[test]
    fn test_seed_for_absent_key_is_silent() {
        let node = test_node(test_config(1), 0, 1);
        let seed = ControlCodec::new()
            .encode(&ControlMessage::Replication {
                keyhash: 12,
                key: "ghost".to_string(),
            })
            .unwrap();
        assert!(node.handle_datagram(&seed).is_empty());
    }

    #[test]
    fn test_replica_push_acks_to_coordinator() {
        let config = test_config(1);
        let node = test_node(config.clone(), 0, 2);
        let push = node
            .codec
            .encode(&KvMessage::RcRequest(RcRequest {
                keyhash: 5,
                ver: 4,
                key: "hot".to_string(),
                value: b"w".to_vec(),
            }))
            .unwrap();
        let out = node.handle_datagram(&push);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, config.lb.unwrap().addr());
        match node.codec.decode(&out[0].0).unwrap() {
            KvMessage::RcAck(ack) => {
                assert_eq!(ack.server_id, 2);
                assert_eq!(ack.ver, 4);
                assert_eq!(ack.keyhash, 5);
            }
            other => panic!("expected replica ack, got {other:?}"),
        }
        assert_eq!(node.store().get("hot").unwrap().ver, 4);

        // an already-fresher copy stays silent
        node.store().put("hot", 9, b"newer");
        assert!(node.handle_datagram(&push).is_empty());
        assert_eq!(node.store().get("hot").unwrap().ver, 9);
    }

    #[test]
    fn test_garbage_is_dropped() {
        let node = test_node(test_config(1), 0, 0);
        assert!(node.handle_datagram(&[0xde, 0xad]).is_empty());
        assert!(node.handle_datagram(&[]).is_empty());
    }
}
