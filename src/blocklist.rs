//! IP membership test consulted before dialing or accepting a peer.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A list of CIDR ranges. Empty means nothing is blocked.
#[derive(Debug, Default, Clone)]
pub struct Blocklist {
    v4: Vec<(u32, u32)>,
    v6: Vec<(u128, u128)>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one rule per line in "a.b.c.d/prefix" form, bare addresses
    /// allowed. Lines that don't parse are counted and skipped.
    pub fn load(rules: &str) -> (Self, usize) {
        let mut list = Self::new();
        let mut skipped = 0;

        for line in rules.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if list.add(line).is_none() {
                skipped += 1;
            }
        }

        (list, skipped)
    }

    pub fn add(&mut self, rule: &str) -> Option<()> {
        let (ip, prefix) = match rule.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (rule, None),
        };

        match ip.parse::<IpAddr>().ok()? {
            IpAddr::V4(ip) => {
                let prefix: u32 = match prefix {
                    Some(p) => p.parse().ok()?,
                    None => 32,
                };
                if prefix > 32 {
                    return None;
                }
                let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
                self.v4.push((u32::from(ip) & mask, mask));
            }
            IpAddr::V6(ip) => {
                let prefix: u32 = match prefix {
                    Some(p) => p.parse().ok()?,
                    None => 128,
                };
                if prefix > 128 {
                    return None;
                }
                let mask =
                    if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
                self.v6.push((u128::from(ip) & mask, mask));
            }
        }
        Some(())
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(ip) => self.contains_v4(ip),
            IpAddr::V6(ip) => self.contains_v6(ip),
        }
    }

    fn contains_v4(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        self.v4.iter().any(|(net, mask)| ip & mask == *net)
    }

    fn contains_v6(&self, ip: Ipv6Addr) -> bool {
        let ip = u128::from(ip);
        self.v6.iter().any(|(net, mask)| ip & mask == *net)
    }
}
