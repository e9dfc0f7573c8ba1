//! The `controller` module implements the operator-side client that resets
//! the fabric's replicated-key budget: broadcast a reset request to every
//! rack's controller endpoint, then wait briefly for one acknowledgment.

use {
    crate::{
        result::Result,
        wire::{Ack, ControlCodec, ControlMessage},
    },
    log::{info, warn},
    std::{
        net::{SocketAddr, UdpSocket},
        time::{Duration, Instant},
    },
};

/// Broadcast `RESET_REQ` to `targets` and wait up to `timeout` for a
/// positive `RESET_REPLY`. Returns whether an ack arrived; the fabric works
/// without one, so callers treat `false` as advisory.
pub fn run_reset(
    sock: &UdpSocket,
    targets: &[SocketAddr],
    num_nodes: u16,
    num_rkeys: u16,
    timeout: Duration,
) -> Result<bool> {
    let codec = ControlCodec::new();
    let request = codec.encode(&ControlMessage::ResetRequest {
        num_nodes,
        num_rkeys,
    })?;
    for target in targets {
        sock.send_to(&request, target)?;
        info!("reset request sent to {target}");
    }

    sock.set_read_timeout(Some(Duration::from_millis(100)))?;
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 64];
    while Instant::now() < deadline {
        let nbytes = match sock.recv_from(&mut buf) {
            Ok((nbytes, _)) => nbytes,
            Err(_) => continue,
        };
        match codec.decode(&buf[..nbytes]) {
            Ok(ControlMessage::ResetReply { ack: Ack::Ok }) => return Ok(true),
            Ok(ControlMessage::ResetReply { ack: Ack::Failed }) => {
                warn!("fabric rejected reset");
                return Ok(false);
            }
            _ => continue,
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use {super::*, std::net::UdpSocket};

    #[test]
    fn test_reset_round_trip() {
        let controller = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fabric_side = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fabric_addr = fabric_side.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (nbytes, from) = fabric_side.recv_from(&mut buf).unwrap();
            let codec = ControlCodec::new();
            let msg = codec.decode(&buf[..nbytes]).unwrap();
            assert_eq!(
                msg,
                ControlMessage::ResetRequest {
                    num_nodes: 4,
                    num_rkeys: 32
                }
            );
            let reply = codec
                .encode(&ControlMessage::ResetReply { ack: Ack::Ok })
                .unwrap();
            fabric_side.send_to(&reply, from).unwrap();
        });

        let acked = run_reset(
            &controller,
            &[fabric_addr],
            4,
            32,
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(acked);
        handle.join().unwrap();
    }

    #[test]
    fn test_reset_times_out_quietly() {
        let controller = UdpSocket::bind("127.0.0.1:0").unwrap();
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let acked = run_reset(
            &controller,
            &[silent.local_addr().unwrap()],
            4,
            32,
            Duration::from_millis(200),
        )
        .unwrap();
        assert!(!acked);
    }
}
