//! The `packet` module defines the fixed-size datagram buffer moved between
//! the streamer threads and the fabric pipelines.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Maximum over-the-wire size of an application datagram.
pub const PACKET_DATA_SIZE: usize = 1232;

#[derive(Clone, Debug)]
pub struct Meta {
    pub size: usize,
    pub addr: IpAddr,
    pub port: u16,
}

impl Default for Meta {
    fn default() -> Self {
        Meta {
            size: 0,
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

impl Meta {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    pub fn set_addr(&mut self, a: &SocketAddr) {
        self.addr = a.ip();
        self.port = a.port();
    }
}

#[derive(Clone)]
pub struct Packet {
    pub data: [u8; PACKET_DATA_SIZE],
    pub meta: Meta,
}

impl Default for Packet {
    fn default() -> Self {
        Packet {
            data: [0u8; PACKET_DATA_SIZE],
            meta: Meta::default(),
        }
    }
}

impl Packet {
    pub fn from_data(dest: &SocketAddr, data: &[u8]) -> Option<Self> {
        if data.len() > PACKET_DATA_SIZE {
            return None;
        }
        let mut packet = Packet::default();
        packet.data[..data.len()].copy_from_slice(data);
        packet.meta.size = data.len();
        packet.meta.set_addr(dest);
        Some(packet)
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.meta.size]
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Packet {{ size: {:?}, addr: {:?} }}",
            self.meta.size,
            self.meta.addr()
        )
    }
}

pub type PacketBatch = Vec<Packet>;

#[cfg(test)]
mod tests {
    use {super::*, std::net::SocketAddr};

    #[test]
    fn test_from_data() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let p = Packet::from_data(&addr, b"hello").unwrap();
        assert_eq!(p.payload(), b"hello");
        assert_eq!(p.meta.addr(), addr);
        assert!(Packet::from_data(&addr, &[0u8; PACKET_DATA_SIZE + 1]).is_none());
    }
}
