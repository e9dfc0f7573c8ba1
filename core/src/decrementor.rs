//! The `decrementor` module emits the periodic load-decay packets: one DEC
//! per even-numbered node every interval, pre-encoded once and pushed at the
//! coordinator. Load decay happens elsewhere in the fabric; the contract
//! here is only to generate the packets.

use {
    crate::{
        config::Config,
        service::Service,
        wire::{Load, NodeId, IDENT_REPLICATED, OP_DEC, PACKET_BASE_SIZE},
    },
    log::trace,
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

/// Pre-encode the DEC packet for one node.
pub fn dec_packet(node: NodeId, amount: Load) -> Vec<u8> {
    let mut buf = vec![0u8; PACKET_BASE_SIZE];
    buf[0..2].copy_from_slice(&IDENT_REPLICATED.to_be_bytes());
    buf[2] = OP_DEC;
    buf[8] = node;
    buf[9..11].copy_from_slice(&amount.to_be_bytes());
    buf
}

pub struct DecrementorService {
    thread_hdls: Vec<JoinHandle<()>>,
}

impl DecrementorService {
    pub fn new(
        config: Arc<Config>,
        sock: UdpSocket,
        interval: Duration,
        amount: Load,
        exit: Arc<AtomicBool>,
    ) -> Self {
        let thread_hdl = Builder::new()
            .name("skmr-decrementor".to_string())
            .spawn(move || {
                let lb = config.lb.expect("decrementor requires an lb entry").addr();
                let packets: Vec<Vec<u8>> = (0..config.num_nodes() / 2)
                    .map(|i| dec_packet((i * 2) as NodeId, amount))
                    .collect();
                while !exit.load(Ordering::Relaxed) {
                    sleep(interval);
                    for packet in &packets {
                        if let Err(err) = sock.send_to(packet, lb) {
                            trace!("dec send failed: {err}");
                        }
                    }
                }
            })
            .unwrap();
        DecrementorService {
            thread_hdls: vec![thread_hdl],
        }
    }
}

impl Service for DecrementorService {
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
    use {super::*, crate::coordinator::parse_steer_header};

    #[test]
    fn test_dec_packet_shape() {
        let buf = dec_packet(4, 7);
        assert_eq!(buf.len(), PACKET_BASE_SIZE);
        let header = parse_steer_header(&buf).unwrap();
        assert_eq!(header.op, OP_DEC);
        assert_eq!(header.server_id, 4);
        assert_eq!(header.load, 7);
        assert_eq!(header.keyhash, 0);
    }

    #[test]
    fn test_even_node_fanout() {
        // six nodes -> packets for nodes 0, 2, 4
        let packets: Vec<Vec<u8>> = (0..6u8 / 2).map(|i| dec_packet(i * 2, 1)).collect();
        let nodes: Vec<u8> = packets
            .iter()
            .map(|p| parse_steer_header(p).unwrap().server_id)
            .collect();
        assert_eq!(nodes, vec![0, 2, 4]);
    }
}
