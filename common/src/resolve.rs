use std::net::Ipv4Addr;

use log::{debug, warn};
use thiserror::Error;

pub const NAME_CACHE_CAPACITY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("name cache full ({0} entries)")]
    CacheFull(usize),
}

/// Fixed-capacity hostname to IPv4 table. No live lookups and no eviction.
#[derive(Debug, Clone, Default)]
pub struct NameCache {
    entries: Vec<(String, Ipv4Addr)>,
}

impl NameCache {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(NAME_CACHE_CAPACITY),
        }
    }

    /// Adds `host`, or replaces its address when already present.
    pub fn insert(&mut self, host: &str, addr: Ipv4Addr) -> Result<(), ResolveError> {
        if let Some(entry) = self.entries.iter_mut().find(|(name, _)| name == host) {
            entry.1 = addr;
            debug!("name cache updated `{host}` -> {addr}");
            return Ok(());
        }

        if self.entries.len() >= NAME_CACHE_CAPACITY {
            warn!("name cache full; `{host}` not added");
            return Err(ResolveError::CacheFull(NAME_CACHE_CAPACITY));
        }

        self.entries.push((host.to_string(), addr));
        debug!("name cache added `{host}` -> {addr}");
        Ok(())
    }

    pub fn lookup(&self, host: &str) -> Option<Ipv4Addr> {
        self.entries
            .iter()
            .find(|(name, _)| name == host)
            .map(|(_, addr)| *addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Seeds `host` when it is written as a dotted-quad literal.
    pub fn seed_literal(&mut self, host: &str) -> Result<bool, ResolveError> {
        match host.parse::<Ipv4Addr>() {
            Ok(addr) => self.insert(host, addr).map(|()| true),
            Err(_) => Ok(false),
        }
    }
}

/// Parses `name=a.b.c.d,name2=...` pairs. Malformed entries are skipped.
pub fn parse_host_list(list: &str) -> Vec<(String, Ipv4Addr)> {
    list.split(',')
        .filter_map(|entry| {
            let (name, addr) = entry.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            match addr.trim().parse::<Ipv4Addr>() {
                Ok(addr) => Some((name.to_string(), addr)),
                Err(_) => {
                    warn!("ignoring host entry `{entry}`: invalid IPv4 address");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn lookup_is_exact_match() {
        let mut cache = NameCache::new();
        cache
            .insert("broker.lan", Ipv4Addr::new(10, 0, 0, 2))
            .unwrap();

        assert_eq!(cache.lookup("broker.lan"), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(cache.lookup("BROKER.lan"), None);
        assert_eq!(cache.lookup("broker"), None);
    }

    #[test]
    fn insert_fails_once_full_without_overwriting() {
        let mut cache = NameCache::new();
        for i in 0..NAME_CACHE_CAPACITY {
            cache
                .insert(&format!("host{i}"), Ipv4Addr::new(10, 0, 0, i as u8))
                .unwrap();
        }

        assert_eq!(
            cache.insert("extra", Ipv4Addr::LOCALHOST),
            Err(ResolveError::CacheFull(NAME_CACHE_CAPACITY))
        );
        assert_eq!(cache.lookup("extra"), None);
        assert_eq!(cache.lookup("host0"), Some(Ipv4Addr::new(10, 0, 0, 0)));
    }

    #[test]
    fn reinsert_updates_in_place() {
        let mut cache = NameCache::new();
        for i in 0..NAME_CACHE_CAPACITY {
            cache
                .insert(&format!("host{i}"), Ipv4Addr::new(10, 0, 0, i as u8))
                .unwrap();
        }

        cache.insert("host3", Ipv4Addr::new(192, 168, 1, 3)).unwrap();
        assert_eq!(cache.len(), NAME_CACHE_CAPACITY);
        assert_eq!(cache.lookup("host3"), Some(Ipv4Addr::new(192, 168, 1, 3)));
    }

    #[test]
    fn seeds_only_ipv4_literals() {
        let mut cache = NameCache::new();
        assert_eq!(cache.seed_literal("192.168.1.20"), Ok(true));
        assert_eq!(cache.seed_literal("mqtt.example.com"), Ok(false));
        assert_eq!(
            cache.lookup("192.168.1.20"),
            Some(Ipv4Addr::new(192, 168, 1, 20))
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn parses_host_list_skipping_garbage() {
        let hosts = parse_host_list("broker.lan=10.0.0.2, bad=999.1.1.1,=1.2.3.4,noeq, nas=10.0.0.9");
        assert_eq!(
            hosts,
            vec![
                ("broker.lan".to_string(), Ipv4Addr::new(10, 0, 0, 2)),
                ("nas".to_string(), Ipv4Addr::new(10, 0, 0, 9)),
            ]
        );
    }
}
