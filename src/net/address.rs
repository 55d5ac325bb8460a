use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use rustc_hash::FxHashMap;

/// The key of a connection (and of the docker driving it): the peer's address, and our own
///  address if it is known
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct SocketPair {
    pub remote: SocketAddr,
    pub local: Option<SocketAddr>,
}
impl SocketPair {
    pub fn new(remote: SocketAddr, local: Option<SocketAddr>) -> SocketPair {
        SocketPair { remote, local }
    }
}
impl Debug for SocketPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.local {
            Some(local) => write!(f, "[{:?}<-{:?}]", self.remote, local),
            None => write!(f, "[{:?}<-*]", self.remote),
        }
    }
}

/// Map keyed by (remote, local) address pairs.
///
/// Lookups are lenient regarding the local address since callers often do not know (or care)
///  which local address a connection is bound to: If there is no exact match, a lookup without
///  local address returns any entry for the remote address, and a lookup with local address
///  falls back to an entry that was registered without one.
pub struct AddressPairMap<V> {
    map: FxHashMap<SocketAddr, FxHashMap<Option<SocketAddr>, V>>,
}

impl <V> Default for AddressPairMap<V> {
    fn default() -> Self {
        AddressPairMap {
            map: Default::default(),
        }
    }
}

impl <V> AddressPairMap<V> {
    pub fn new() -> AddressPairMap<V> {
        Self::default()
    }

    pub fn get(&self, remote: SocketAddr, local: Option<SocketAddr>) -> Option<&V> {
        let by_local = self.map.get(&remote)?;
        if let Some(v) = by_local.get(&local) {
            return Some(v);
        }
        match local {
            None => by_local.values().next(),
            Some(_) => by_local.get(&None),
        }
    }

    /// returns the previous value for exactly this pair, if any
    pub fn insert(&mut self, remote: SocketAddr, local: Option<SocketAddr>, value: V) -> Option<V> {
        self.map.entry(remote)
            .or_default()
            .insert(local, value)
    }

    /// removes the entry that [AddressPairMap::get] would return for the pair
    pub fn remove(&mut self, remote: SocketAddr, local: Option<SocketAddr>) -> Option<V> {
        let by_local = self.map.get_mut(&remote)?;
        let key = if by_local.contains_key(&local) {
            local
        }
        else {
            match local {
                None => *by_local.keys().next()?,
                Some(_) => None,
            }
        };
        let removed = by_local.remove(&key);
        if by_local.is_empty() {
            self.map.remove(&remote);
        }
        removed
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.map.values().flat_map(|m| m.values())
    }

    pub fn iter(&self) -> impl Iterator<Item = (SocketPair, &V)> {
        self.map.iter()
            .flat_map(|(remote, m)| m.iter().map(|(local, v)| (SocketPair::new(*remote, *local), v)))
    }

    pub fn retain(&mut self, mut f: impl FnMut(SocketPair, &V) -> bool) {
        for (remote, by_local) in self.map.iter_mut() {
            by_local.retain(|local, v| f(SocketPair::new(*remote, *local), v));
        }
        self.map.retain(|_, by_local| !by_local.is_empty());
    }

    pub fn len(&self) -> usize {
        self.map.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[rstest]
    #[case::exact(Some(2), Some(2), Some("a"))]
    #[case::wildcard_lookup(None, Some(2), Some("a"))]
    #[case::wildcard_entry(Some(2), None, Some("a"))]
    #[case::both_wildcard(None, None, Some("a"))]
    fn test_get_single(#[case] stored_local: Option<u16>, #[case] lookup_local: Option<u16>, #[case] expected: Option<&str>) {
        let mut map = AddressPairMap::new();
        map.insert(addr(1), stored_local.map(addr), "a");
        assert_eq!(map.get(addr(1), lookup_local.map(addr)).cloned(), expected);
        assert_eq!(map.get(addr(9), lookup_local.map(addr)), None);
    }

    #[test]
    fn test_different_local_does_not_match() {
        let mut map = AddressPairMap::new();
        map.insert(addr(1), Some(addr(2)), "a");
        assert_eq!(map.get(addr(1), Some(addr(3))), None);
        assert_eq!(map.remove(addr(1), Some(addr(3))), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_insert_remove() {
        let mut map = AddressPairMap::new();
        assert_eq!(map.insert(addr(1), Some(addr(2)), "a"), None);
        assert_eq!(map.insert(addr(1), Some(addr(3)), "b"), None);
        assert_eq!(map.insert(addr(1), Some(addr(2)), "c"), Some("a"));
        assert_eq!(map.len(), 2);

        assert_eq!(map.remove(addr(1), Some(addr(3))), Some("b"));
        assert_eq!(map.remove(addr(1), None), Some("c"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_retain() {
        let mut map = AddressPairMap::new();
        map.insert(addr(1), None, 1);
        map.insert(addr(2), Some(addr(5)), 2);
        map.insert(addr(3), None, 3);
        map.retain(|pair, v| pair.remote != addr(2) && *v != 3);
        assert_eq!(map.values().cloned().collect::<Vec<_>>(), vec![1]);
    }
}
