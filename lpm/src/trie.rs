// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Longest-prefix-match map over [`prefix_trie::PrefixMap`].

use prefix_trie::PrefixMap;

use crate::prefix::{IpPrefix, Ipv4Prefix, Ipv6Prefix};

impl prefix_trie::Prefix for Ipv4Prefix {
    type R = u32;

    fn repr(&self) -> u32 {
        self.network().to_bits()
    }
    fn prefix_len(&self) -> u8 {
        self.len()
    }
    fn from_repr_len(repr: u32, len: u8) -> Self {
        Ipv4Prefix::new(std::net::Ipv4Addr::from_bits(repr), len)
            .unwrap_or_else(|_| unreachable!("invalid prefix from repr: {repr:#x}/{len}"))
    }
}

impl prefix_trie::Prefix for Ipv6Prefix {
    type R = u128;

    fn repr(&self) -> u128 {
        self.network().to_bits()
    }
    fn prefix_len(&self) -> u8 {
        self.len()
    }
    fn from_repr_len(repr: u128, len: u8) -> Self {
        Ipv6Prefix::new(std::net::Ipv6Addr::from_bits(repr), len)
            .unwrap_or_else(|_| unreachable!("invalid prefix from repr: {repr:#x}/{len}"))
    }
}

/// A per-family longest-prefix-match container.
///
/// `iter` yields entries in increasing mask length, then by network address.
#[allow(clippy::len_without_is_empty)]
pub trait TrieMap: Default {
    type Prefix: IpPrefix;
    type Value;

    /// Exact-match retrieval; this does not do LPM.
    fn get(&self, prefix: &Self::Prefix) -> Option<&Self::Value>;
    /// Exact-match retrieval, mutable.
    fn get_mut(&mut self, prefix: &Self::Prefix) -> Option<&mut Self::Value>;
    /// Store a value at a prefix, returning the previous one if any.
    fn insert(&mut self, prefix: Self::Prefix, value: Self::Value) -> Option<Self::Value>;
    /// Erase a prefix, returning its value if it was present.
    fn remove(&mut self, prefix: &Self::Prefix) -> Option<Self::Value>;

    /// Longest-prefix match for an address.
    fn lookup<Q>(&self, addr: &Q) -> Option<(&Self::Prefix, &Self::Value)>
    where
        Q: Into<Self::Prefix> + Clone;

    /// Iterate in increasing mask length, then network address.
    fn iter(&self) -> impl Iterator<Item = (&Self::Prefix, &Self::Value)>;
    /// Iterate in trie (lexicographic bit) order. Cheaper than [`TrieMap::iter`].
    fn iter_unordered(&self) -> impl Iterator<Item = (&Self::Prefix, &Self::Value)>;

    fn len(&self) -> usize;
    fn is_empty(&self) -> bool;
}

#[derive(Clone, Debug)]
pub struct PrefixMapTrie<P, V>(PrefixMap<P, V>)
where
    P: IpPrefix + prefix_trie::Prefix;

impl<P, V> Default for PrefixMapTrie<P, V>
where
    P: IpPrefix + prefix_trie::Prefix,
{
    fn default() -> Self {
        Self(PrefixMap::new())
    }
}

impl<P, V> PrefixMapTrie<P, V>
where
    P: IpPrefix + prefix_trie::Prefix,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<P, V> TrieMap for PrefixMapTrie<P, V>
where
    P: IpPrefix + prefix_trie::Prefix,
{
    type Prefix = P;
    type Value = V;

    fn get(&self, prefix: &P) -> Option<&V> {
        self.0.get(prefix)
    }

    fn get_mut(&mut self, prefix: &P) -> Option<&mut V> {
        self.0.get_mut(prefix)
    }

    fn insert(&mut self, prefix: P, value: V) -> Option<V> {
        self.0.insert(prefix, value)
    }

    fn remove(&mut self, prefix: &P) -> Option<V> {
        self.0.remove(prefix)
    }

    fn lookup<Q>(&self, addr: &Q) -> Option<(&P, &V)>
    where
        Q: Into<P> + Clone,
    {
        self.0.get_lpm(&addr.clone().into())
    }

    fn iter(&self) -> impl Iterator<Item = (&P, &V)> {
        let mut entries: Vec<(&P, &V)> = self.0.iter().collect();
        entries.sort_by_key(|(p, _)| (p.len(), p.network()));
        entries.into_iter()
    }

    fn iter_unordered(&self) -> impl Iterator<Item = (&P, &V)> {
        self.0.iter()
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn is_empty(&self) -> bool {
        self.0.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn p4(s: &str) -> Ipv4Prefix {
        Ipv4Prefix::from_str(s).expect("bad prefix")
    }

    #[test]
    fn test_insert_get_remove() {
        let mut trie: PrefixMapTrie<Ipv4Prefix, u32> = PrefixMapTrie::new();
        assert!(trie.is_empty());

        assert_eq!(trie.insert(p4("10.0.0.0/8"), 1), None);
        assert_eq!(trie.insert(p4("10.0.0.0/8"), 2), Some(1));
        assert_eq!(trie.len(), 1);

        assert_eq!(trie.get(&p4("10.0.0.0/8")), Some(&2));
        /* exact match only */
        assert_eq!(trie.get(&p4("10.0.0.0/16")), None);

        assert_eq!(trie.remove(&p4("10.0.0.0/8")), Some(2));
        assert_eq!(trie.remove(&p4("10.0.0.0/8")), None);
        assert!(trie.is_empty());
    }

    #[test]
    fn test_longest_match() {
        let mut trie: PrefixMapTrie<Ipv4Prefix, &str> = PrefixMapTrie::new();
        trie.insert(p4("0.0.0.0/0"), "default");
        trie.insert(p4("10.0.0.0/8"), "coarse");
        trie.insert(p4("10.1.0.0/16"), "fine");

        let addr = Ipv4Addr::new(10, 1, 2, 3);
        let (longest, value) = trie.lookup(&addr).expect("must match");
        assert_eq!(*longest, p4("10.1.0.0/16"));
        assert_eq!(*value, "fine");

        let addr = Ipv4Addr::new(10, 200, 0, 1);
        let (longest, value) = trie.lookup(&addr).expect("must match");
        assert_eq!(*longest, p4("10.0.0.0/8"));
        assert_eq!(*value, "coarse");

        let addr = Ipv4Addr::new(192, 0, 2, 1);
        let (longest, value) = trie.lookup(&addr).expect("must match");
        assert_eq!(*longest, p4("0.0.0.0/0"));
        assert_eq!(*value, "default");

        trie.remove(&p4("0.0.0.0/0"));
        assert!(trie.lookup(&Ipv4Addr::new(192, 0, 2, 1)).is_none());
    }

    #[test]
    fn test_iter_order() {
        let mut trie: PrefixMapTrie<Ipv4Prefix, ()> = PrefixMapTrie::new();
        for s in ["10.2.0.0/16", "10.0.0.0/8", "10.1.0.0/16", "0.0.0.0/0"] {
            trie.insert(p4(s), ());
        }
        let order: Vec<String> = trie.iter().map(|(p, ())| p.to_string()).collect();
        assert_eq!(
            order,
            ["0.0.0.0/0", "10.0.0.0/8", "10.1.0.0/16", "10.2.0.0/16"]
        );
    }
}
