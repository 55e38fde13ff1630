use std::collections::HashMap;
use std::hash::BuildHasher;
use std::hash::Hasher;

/// A map keyed by values that carry their own precomputed hash. The hasher just passes that hash
/// through, so we never hash a name more than once no matter how many maps it visits.
pub(crate) type PassThroughHashMap<K, V> = HashMap<PreHashed<K>, V, PassThroughHasher>;

#[derive(Default)]
pub(crate) struct PassThroughHasher {
    hash: u64,
}

impl Hasher for PassThroughHasher {
    fn finish(&self) -> u64 {
        self.hash
    }

    fn write_u64(&mut self, i: u64) {
        self.hash = i;
    }

    fn write(&mut self, _bytes: &[u8]) {
        panic!("pass-through hashing requires keys that hash as a single u64");
    }
}

impl BuildHasher for PassThroughHasher {
    type Hasher = PassThroughHasher;

    fn build_hasher(&self) -> Self::Hasher {
        PassThroughHasher::default()
    }
}

pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = foldhash::fast::FixedState::default().build_hasher();
    hasher.write(bytes);
    hasher.finish()
}

#[derive(Eq, Clone, Copy)]
pub(crate) struct PreHashed<T> {
    value: T,
    hash: u64,
}

impl<T: PartialEq> PartialEq for PreHashed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T> PreHashed<T> {
    pub(crate) fn new(value: T, hash: u64) -> Self {
        Self { value, hash }
    }
}

impl<T> std::hash::Hash for PreHashed<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_bytes_hash_equal() {
        assert_eq!(hash_bytes(b"main"), hash_bytes(b"main"));
        assert_ne!(hash_bytes(b"main"), hash_bytes(b"_start"));
    }

    #[test]
    fn map_lookup_uses_stored_hash() {
        let mut map: PassThroughHashMap<&[u8], u32> = PassThroughHashMap::default();
        let key = PreHashed::new(b"abc".as_slice(), hash_bytes(b"abc"));
        map.insert(key, 7);
        assert_eq!(map.get(&key), Some(&7));
    }
}
