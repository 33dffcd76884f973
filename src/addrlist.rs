//! Bounded priority set of candidate peer addresses.
use std::net::SocketAddr;

use hashbrown::HashSet;

/// Where an address came from. Sources the operator trusts more rank higher
/// when the list is full or when picking the next dial target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddrSource {
    Dht = 0,
    Tracker = 1,
    Manual = 2,
}

/// Keeps addresses to connect to, deduplicated, ordered by source priority
/// and bounded in size. When full, the lowest priority entries are dropped
/// first.
#[derive(Debug)]
pub struct AddrList {
    // one bucket per source, highest priority last
    buckets: [Vec<SocketAddr>; 3],
    known: HashSet<SocketAddr>,
    limit: usize,
}

impl AddrList {
    pub fn new(limit: usize) -> Self {
        Self {
            buckets: [Vec::new(), Vec::new(), Vec::new()],
            known: HashSet::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge a batch of addresses. Duplicates and already known addresses
    /// are ignored; overflow evicts from the lowest priority bucket.
    pub fn push(&mut self, addrs: impl IntoIterator<Item = SocketAddr>, source: AddrSource) {
        for addr in addrs {
            if !self.known.insert(addr) {
                continue;
            }
            self.buckets[source as usize].push(addr);

            if self.len() > self.limit {
                self.evict_lowest();
            }
        }
    }

    /// Take the best candidate to dial next.
    pub fn pop(&mut self) -> Option<SocketAddr> {
        for bucket in self.buckets.iter_mut().rev() {
            if let Some(addr) = bucket.pop() {
                self.known.remove(&addr);
                return Some(addr);
            }
        }
        None
    }

    /// Forget an address entirely, e.g. after it errored.
    pub fn remove(&mut self, addr: &SocketAddr) {
        if self.known.remove(addr) {
            for bucket in self.buckets.iter_mut() {
                bucket.retain(|a| a != addr);
            }
        }
    }

    fn evict_lowest(&mut self) {
        for bucket in self.buckets.iter_mut() {
            if !bucket.is_empty() {
                let addr = bucket.remove(0);
                self.known.remove(&addr);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn dedupes_and_pops_by_priority() {
        let mut list = AddrList::new(10);
        list.push([addr(1), addr(1), addr(2)], AddrSource::Dht);
        list.push([addr(3)], AddrSource::Tracker);
        list.push([addr(4)], AddrSource::Manual);

        assert_eq!(list.len(), 4);
        assert_eq!(list.pop(), Some(addr(4)));
        assert_eq!(list.pop(), Some(addr(3)));
        // dht addresses drain last
        assert!(matches!(list.pop(), Some(a) if a == addr(1) || a == addr(2)));
    }

    #[test]
    fn full_list_drops_lowest_priority_first() {
        let mut list = AddrList::new(2);
        list.push([addr(1), addr(2)], AddrSource::Dht);
        list.push([addr(3)], AddrSource::Tracker);

        assert_eq!(list.len(), 2);
        // the tracker address survived the eviction
        let mut drained = Vec::new();
        while let Some(a) = list.pop() {
            drained.push(a);
        }
        assert!(drained.contains(&addr(3)));
    }

    #[test]
    fn popped_addr_can_be_reinserted() {
        let mut list = AddrList::new(10);
        list.push([addr(1)], AddrSource::Tracker);
        assert_eq!(list.pop(), Some(addr(1)));
        assert!(list.is_empty());

        list.push([addr(1)], AddrSource::Tracker);
        assert_eq!(list.len(), 1);
    }
}
