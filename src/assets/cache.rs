use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Shared, read-only asset store. Values are reference counted so every avatar
/// instance can hold the same mesh or morph blob.
#[derive(Debug)]
pub struct AssetCache<K, V> {
    cache: HashMap<K, Arc<V>>,
}

impl<K, V> Default for AssetCache<K, V> {
    fn default() -> Self {
        AssetCache {
            cache: HashMap::new(),
        }
    }
}

impl<K, V> AssetCache<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.cache.get(key).cloned()
    }

    /// Store `value`, returning the entry it replaces
    pub fn insert(&mut self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        self.cache.insert(key, value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.cache.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.cache.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_shares_and_replaces() {
        let mut cache: AssetCache<String, u32> = AssetCache::new();
        let first = Arc::new(1);
        assert!(cache.insert("a".into(), first.clone()).is_none());
        let held = cache.get(&"a".into()).unwrap();
        assert!(Arc::ptr_eq(&held, &first));

        let old = cache.insert("a".into(), Arc::new(2)).unwrap();
        assert_eq!(*old, 1);
        assert_eq!(*cache.get(&"a".into()).unwrap(), 2);
        // earlier holders keep the value they were given
        assert_eq!(*held, 1);
        assert_eq!(cache.len(), 1);
    }
}
