//! The `streamer` module moves datagrams between UDP sockets and channels:
//! a receiver thread coalesces arrivals into packet batches, a responder
//! thread drains outbound buffers.

use {
    crate::packet::{Packet, PacketBatch, PACKET_DATA_SIZE},
    crossbeam_channel::{Receiver, RecvTimeoutError, Sender},
    log::{debug, trace},
    skimmer_metrics::inc_new_counter_debug,
    std::{
        io,
        net::{SocketAddr, UdpSocket},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{Builder, JoinHandle},
        time::Duration,
    },
};

pub type PacketBatchSender = Sender<PacketBatch>;
pub type PacketBatchReceiver = Receiver<PacketBatch>;
pub type ResponseSender = Sender<(Vec<u8>, SocketAddr)>;
pub type ResponseReceiver = Receiver<(Vec<u8>, SocketAddr)>;

/// Most packets drained into one batch before it is handed downstream.
const MAX_BATCH: usize = 64;

fn recv_batch(sock: &UdpSocket) -> io::Result<PacketBatch> {
    let mut batch = PacketBatch::new();
    let mut packet = Packet::default();
    // wait (bounded by the socket read timeout) for the first packet
    let (size, addr) = sock.recv_from(&mut packet.data)?;
    packet.meta.size = size;
    packet.meta.set_addr(&addr);
    batch.push(packet);
    // then drain whatever else is already queued
    sock.set_nonblocking(true)?;
    while batch.len() < MAX_BATCH {
        let mut packet = Packet::default();
        match sock.recv_from(&mut packet.data) {
            Ok((size, addr)) => {
                packet.meta.size = size;
                packet.meta.set_addr(&addr);
                batch.push(packet);
            }
            Err(_) => break,
        }
    }
    sock.set_nonblocking(false)?;
    Ok(batch)
}

/// Spawn a thread that reads datagrams off `sock` into batches on `sender`
/// until `exit` is raised.
pub fn receiver(
    sock: Arc<UdpSocket>,
    exit: Arc<AtomicBool>,
    sender: PacketBatchSender,
    name: &'static str,
) -> JoinHandle<()> {
    sock.set_read_timeout(Some(Duration::from_millis(250)))
        .expect("set socket read timeout");
    Builder::new()
        .name(format!("skmr-receiver-{name}"))
        .spawn(move || {
            trace!("{name} receiver started");
            loop {
                if exit.load(Ordering::Relaxed) {
                    break;
                }
                match recv_batch(&sock) {
                    Ok(batch) => {
                        if sender.send(batch).is_err() {
                            break;
                        }
                    }
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) => {}
                    Err(err) => {
                        debug!("{name} receiver error: {err}");
                        inc_new_counter_debug!("streamer-recv_error", 1);
                    }
                }
            }
            trace!("{name} receiver exiting");
        })
        .unwrap()
}

/// Spawn a thread that transmits `(buffer, destination)` pairs from `r`
/// until the channel disconnects. A failed transmit loses the request; the
/// core never retries.
pub fn responder(name: &'static str, sock: Arc<UdpSocket>, r: ResponseReceiver) -> JoinHandle<()> {
    Builder::new()
        .name(format!("skmr-responder-{name}"))
        .spawn(move || loop {
            match r.recv_timeout(Duration::from_millis(250)) {
                Ok((data, addr)) => {
                    if data.len() > PACKET_DATA_SIZE {
                        inc_new_counter_debug!("streamer-send_oversize", 1);
                        continue;
                    }
                    if let Err(err) = sock.send_to(&data, addr) {
                        debug!("{name} send_to {addr} failed: {err}");
                        inc_new_counter_debug!("streamer-send_error", 1);
                    }
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })
        .unwrap()
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crossbeam_channel::unbounded,
        std::{net::UdpSocket, time::Duration},
    };

    #[test]
    fn test_streamer_round_trip() {
        let read = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = read.local_addr().unwrap();
        let send = UdpSocket::bind("127.0.0.1:0").unwrap();
        let send_addr = send.local_addr().unwrap();

        let exit = Arc::new(AtomicBool::new(false));
        let (s_reader, r_reader) = unbounded();
        let t_receiver = receiver(Arc::new(read), exit.clone(), s_reader, "test");

        let (s_responder, r_responder) = unbounded();
        let t_responder = responder("test", Arc::new(send), r_responder);
        s_responder.send((b"ping".to_vec(), addr)).unwrap();

        let batch = r_reader.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload(), b"ping");
        assert_eq!(batch[0].meta.addr(), send_addr);

        exit.store(true, Ordering::Relaxed);
        drop(s_responder);
        t_receiver.join().unwrap();
        t_responder.join().unwrap();
    }

    #[test]
    fn test_batching_coalesces() {
        let read = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = read.local_addr().unwrap();
        let send = UdpSocket::bind("127.0.0.1:0").unwrap();
        for i in 0..10u8 {
            send.send_to(&[i], addr).unwrap();
        }
        let exit = Arc::new(AtomicBool::new(false));
        let (s_reader, r_reader) = unbounded();
        let t_receiver = receiver(Arc::new(read), exit.clone(), s_reader, "batch");
        let mut total = 0;
        while total < 10 {
            let batch = r_reader.recv_timeout(Duration::from_secs(5)).unwrap();
            total += batch.len();
        }
        assert_eq!(total, 10);
        exit.store(true, Ordering::Relaxed);
        t_receiver.join().unwrap();
    }
}
