//! The `config` module loads the deployment topology: racks of server
//! endpoints, client endpoints, the coordinator, and per-rack controller
//! endpoints. Each entry carries the MAC the raw data plane rewrites into
//! frames alongside its IPv4 address and UDP port.

use std::{
    fmt, fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    str::FromStr,
};

pub type MacAddr = [u8; 6];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeEntry {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl NodeEntry {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    /// Malformed directive with its line number.
    Parse { line: usize, reason: String },
    EmptyTopology,
    UnevenRacks,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read configuration: {e}"),
            ConfigError::Parse { line, reason } => {
                write!(f, "configuration line {line}: {reason}")
            }
            ConfigError::EmptyTopology => write!(f, "configuration defines no server nodes"),
            ConfigError::UnevenRacks => {
                write!(f, "all racks must hold the same number of nodes")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

fn parse_mac(s: &str) -> Option<MacAddr> {
    let mut mac = [0u8; 6];
    let mut octets = s.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(octets.next()?, 16).ok()?;
    }
    octets.next().is_none().then_some(mac)
}

fn parse_entry(arg: &str, line: usize) -> Result<NodeEntry, ConfigError> {
    let err = |reason: String| ConfigError::Parse { line, reason };
    let mut fields = arg.split('|');
    let mac = fields
        .next()
        .and_then(parse_mac)
        .ok_or_else(|| err(format!("bad mac address in '{arg}'")))?;
    let ip = fields
        .next()
        .and_then(|s| Ipv4Addr::from_str(s).ok())
        .ok_or_else(|| err(format!("bad ipv4 address in '{arg}'")))?;
    let port = fields
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| err(format!("bad udp port in '{arg}'")))?;
    if fields.next().is_some() {
        return Err(err(format!("trailing fields in '{arg}'")));
    }
    Ok(NodeEntry { mac, ip, port })
}

#[derive(Clone, Debug, Default)]
pub struct Config {
    pub racks: Vec<Vec<NodeEntry>>,
    pub clients: Vec<NodeEntry>,
    pub lb: Option<NodeEntry>,
    pub controllers: Vec<NodeEntry>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        text.parse()
    }

    pub fn num_racks(&self) -> usize {
        self.racks.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.racks.first().map(Vec::len).unwrap_or(0)
    }

    pub fn node(&self, rack_id: usize, node_id: usize) -> &NodeEntry {
        &self.racks[rack_id][node_id]
    }

    pub fn client(&self, client_id: usize) -> &NodeEntry {
        &self.clients[client_id]
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        let mut rack: Vec<NodeEntry> = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut tokens = trimmed.split_whitespace();
            let directive = tokens.next().unwrap();
            let arg = tokens.next();
            let entry = |arg: Option<&str>| {
                arg.ok_or_else(|| ConfigError::Parse {
                    line,
                    reason: format!("'{directive}' requires a <mac>|<ip>|<port> argument"),
                })
                .and_then(|arg| parse_entry(arg, line))
            };
            match directive {
                "rack" => {
                    if !rack.is_empty() {
                        config.racks.push(std::mem::take(&mut rack));
                    }
                }
                "node" => rack.push(entry(arg)?),
                "client" => config.clients.push(entry(arg)?),
                "lb" => config.lb = Some(entry(arg)?),
                "controller" => config.controllers.push(entry(arg)?),
                other => {
                    return Err(ConfigError::Parse {
                        line,
                        reason: format!("unknown directive '{other}'"),
                    });
                }
            }
        }
        if !rack.is_empty() {
            config.racks.push(rack);
        }
        if config.racks.is_empty() || config.num_nodes() == 0 {
            return Err(ConfigError::EmptyTopology);
        }
        if config
            .racks
            .iter()
            .any(|rack| rack.len() != config.num_nodes())
        {
            return Err(ConfigError::UnevenRacks);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    const SAMPLE: &str = "\
# two racks, two nodes each
rack
node 02:00:00:00:00:01|10.0.0.1|5001
node 02:00:00:00:00:02|10.0.0.2|5002
rack
node 02:00:00:00:01:01|10.0.1.1|5001
node 02:00:00:00:01:02|10.0.1.2|5002
client 02:00:00:00:02:01|10.0.2.1|6001
lb 02:00:00:00:03:01|10.0.3.1|7001
controller 02:00:00:00:04:01|10.0.4.1|8001
controller 02:00:00:00:04:02|10.0.4.2|8002
";

    #[test]
    fn test_parse_topology() {
        let config: Config = SAMPLE.parse().unwrap();
        assert_eq!(config.num_racks(), 2);
        assert_eq!(config.num_nodes(), 2);
        assert_eq!(config.clients.len(), 1);
        assert_eq!(config.controllers.len(), 2);

        let node = config.node(1, 0);
        assert_eq!(node.mac, [0x02, 0, 0, 0, 0x01, 0x01]);
        assert_eq!(node.addr(), "10.0.1.1:5001".parse().unwrap());
        assert_eq!(config.lb.unwrap().port, 7001);
    }

    #[test]
    fn test_rejects_malformed_lines() {
        assert_matches!(
            "node nonsense".parse::<Config>(),
            Err(ConfigError::Parse { line: 1, .. })
        );
        assert_matches!(
            "node 02:00:00:00:00:01|999.0.0.1|5001".parse::<Config>(),
            Err(ConfigError::Parse { line: 1, .. })
        );
        assert_matches!(
            "node 02:00:00:00:00:01|10.0.0.1|70000".parse::<Config>(),
            Err(ConfigError::Parse { line: 1, .. })
        );
        assert_matches!(
            "widget 02:00:00:00:00:01|10.0.0.1|5001".parse::<Config>(),
            Err(ConfigError::Parse { line: 1, .. })
        );
    }

    #[test]
    fn test_rejects_empty_and_uneven() {
        assert_matches!("# nothing".parse::<Config>(), Err(ConfigError::EmptyTopology));
        let uneven = "\
node 02:00:00:00:00:01|10.0.0.1|5001
node 02:00:00:00:00:02|10.0.0.2|5002
rack
node 02:00:00:00:01:01|10.0.1.1|5001
";
        assert_matches!(uneven.parse::<Config>(), Err(ConfigError::UnevenRacks));
    }
}
