//! Network configuration file.
//!
//! `config` in the data directory holds `key=value` lines for `dhcp`,
//! `ip`, `netmask` and `gateway`. Unknown keys are ignored and malformed
//! addresses keep their defaults, so a half-written file still boots the
//! appliance.

use std::net::Ipv4Addr;
use std::path::Path;

pub const CONFIG_FILENAME: &str = "config";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub use_dhcp: bool,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            use_dhcp: false,
            ip: Ipv4Addr::new(192, 168, 1, 20),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
        }
    }
}

impl NetworkConfig {
    /// Reads the config file from the data directory; any problem falls
    /// back to the defaults.
    pub fn load(data_dir: &Path) -> NetworkConfig {
        let mut config = NetworkConfig::default();
        let text = match std::fs::read_to_string(data_dir.join(CONFIG_FILENAME)) {
            Ok(text) => text,
            Err(_) => return config,
        };
        config.parse_lines(&text);
        config
    }

    fn parse_lines(&mut self, text: &str) {
        for line in text.lines() {
            let (key, value) = match line.split_once('=') {
                Some(pair) => pair,
                None => continue,
            };
            match key {
                "dhcp" => self.use_dhcp = value.starts_with('1'),
                "ip" => Self::parse_address(value, &mut self.ip),
                "netmask" => Self::parse_address(value, &mut self.netmask),
                "gateway" => Self::parse_address(value, &mut self.gateway),
                _ => {}
            }
        }
    }

    fn parse_address(value: &str, dest: &mut Ipv4Addr) {
        if let Ok(address) = value.trim().parse() {
            *dest = address;
        }
    }
}
