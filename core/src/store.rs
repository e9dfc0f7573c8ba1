//! The `store` module implements the server-side keyed store. Every entry
//! carries the version of the write that produced it; an incoming write is
//! applied iff its version is at least the stored one, so the
//! highest-versioned write wins at every replica regardless of arrival order.

use {
    crate::wire::{Version, BASE_VERSION},
    dashmap::DashMap,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    pub ver: Version,
    pub value: Vec<u8>,
}

impl Default for Item {
    fn default() -> Self {
        Item {
            ver: BASE_VERSION,
            value: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct Store {
    entries: DashMap<String, Item>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    /// Preload `keys` at the base version with a shared default value.
    pub fn preloaded<'a>(keys: impl IntoIterator<Item = &'a str>, default_value: &[u8]) -> Self {
        let store = Store::new();
        for key in keys {
            store.entries.insert(
                key.to_string(),
                Item {
                    ver: BASE_VERSION,
                    value: default_value.to_vec(),
                },
            );
        }
        store
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Item> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Insert or overwrite under the version rule. Returns whether the write
    /// was applied; a stale write leaves the entry untouched.
    pub fn put(&self, key: &str, ver: Version, value: &[u8]) -> bool {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Item { ver, value: value.to_vec() });
        if ver >= entry.ver {
            entry.ver = ver;
            entry.value = value.to_vec();
            true
        } else {
            false
        }
    }

    /// Versioned erase: the entry goes away only if the delete's version is
    /// at least the stored one.
    pub fn del(&self, key: &str, ver: Version) -> bool {
        self.entries
            .remove_if(key, |_, item| ver >= item.ver)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let store = Store::new();
        assert_eq!(store.get("k"), None);
        assert!(store.put("k", 1, b"a"));
        assert_eq!(
            store.get("k"),
            Some(Item {
                ver: 1,
                value: b"a".to_vec()
            })
        );
    }

    #[test]
    fn test_version_rule() {
        let store = Store::new();
        assert!(store.put("k", 5, b"a"));
        // stale write: not applied, entry unchanged
        assert!(!store.put("k", 3, b"b"));
        assert_eq!(store.get("k").unwrap().ver, 5);
        assert_eq!(store.get("k").unwrap().value, b"a");
        // equal version overwrites
        assert!(store.put("k", 5, b"c"));
        assert_eq!(store.get("k").unwrap().value, b"c");
        // newer version overwrites
        assert!(store.put("k", 6, b"d"));
        assert_eq!(store.get("k").unwrap().ver, 6);
    }

    #[test]
    fn test_version_is_monotonic_under_reorder() {
        let store = Store::new();
        for ver in [4u32, 9, 2, 7, 9, 1] {
            store.put("k", ver, format!("v{ver}").as_bytes());
            assert!(store.get("k").unwrap().ver >= ver.min(4));
        }
        assert_eq!(store.get("k").unwrap().ver, 9);
        assert_eq!(store.get("k").unwrap().value, b"v9");
    }

    #[test]
    fn test_del_respects_version() {
        let store = Store::new();
        store.put("k", 5, b"a");
        assert!(!store.del("k", 3));
        assert!(store.get("k").is_some());
        assert!(store.del("k", 5));
        assert_eq!(store.get("k"), None);
        // deleting a missing key is a no-op
        assert!(!store.del("k", 9));
    }

    #[test]
    fn test_preloaded() {
        let store = Store::preloaded(["a", "b"].into_iter(), b"vvvv");
        assert_eq!(store.len(), 2);
        let item = store.get("a").unwrap();
        assert_eq!(item.ver, BASE_VERSION);
        assert_eq!(item.value, b"vvvv");
    }
}
