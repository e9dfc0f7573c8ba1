//! UDP socket helpers shared by the fabric services and their tests.

use {
    log::warn,
    rand::{thread_rng, Rng},
    socket2::{Domain, SockAddr, Socket, Type},
    std::{
        io,
        net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    },
};

pub type PortRange = (u16, u16);

fn udp_socket(reuseaddr: bool) -> io::Result<Socket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    if reuseaddr {
        sock.set_reuse_address(true)?;
        #[cfg(unix)]
        sock.set_reuse_port(true)?;
    }
    Ok(sock)
}

/// Bind a UDP socket to `port` on all interfaces.
pub fn bind_to(port: u16, reuseaddr: bool) -> io::Result<UdpSocket> {
    let sock = udp_socket(reuseaddr)?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    sock.bind(&SockAddr::from(addr))?;
    Ok(sock.into())
}

/// Bind a UDP socket to the first free port in `range`, trying a random
/// offset first so concurrent callers spread out.
pub fn bind_in_range(range: PortRange) -> io::Result<(u16, UdpSocket)> {
    let (start, end) = range;
    let mut tries_left = end.saturating_sub(start);
    let mut port = thread_rng().gen_range(start..end);
    loop {
        match bind_to(port, false) {
            Ok(sock) => {
                break Ok((sock.local_addr().unwrap().port(), sock));
            }
            Err(err) => {
                if tries_left == 0 {
                    warn!("bind_in_range of {:?} failed: {}", range, err);
                    break Err(err);
                }
            }
        }
        port += 1;
        if port == end {
            port = start;
        }
        tries_left -= 1;
    }
}

/// Find a port in `range` that is currently free to bind.
pub fn find_available_port_in_range(range: PortRange) -> io::Result<u16> {
    let (port, _sock) = bind_in_range(range)?;
    Ok(port)
}
