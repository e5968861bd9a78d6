use rustc_hash::FxHashMap;

/// Opaque handle for an item in a [Bag]. Handles are never reused within a bag.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct BagKey(u64);

/// An unordered collection with O(1) insertion and removal by handle. Iteration works on a
///  snapshot (see [Bag::copy_items]), so items can be removed while their snapshot is being
///  processed.
pub struct Bag<T> {
    items: FxHashMap<BagKey, T>,
    next_key: u64,
}

impl <T> Default for Bag<T> {
    fn default() -> Self {
        Bag::new()
    }
}

impl <T> Bag<T> {
    pub fn new() -> Bag<T> {
        Bag {
            items: FxHashMap::default(),
            next_key: 0,
        }
    }

    pub fn add(&mut self, item: T) -> BagKey {
        let key = BagKey(self.next_key);
        self.next_key += 1;
        self.items.insert(key, item);
        key
    }

    pub fn remove(&mut self, key: BagKey) -> Option<T> {
        self.items.remove(&key)
    }

    pub fn get(&self, key: BagKey) -> Option<&T> {
        self.items.get(&key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Keeps only the items for which `f` returns true
    pub fn retain(&mut self, mut f: impl FnMut(BagKey, &mut T) -> bool) {
        self.items.retain(|k, v| f(*k, v));
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain()
            .map(|(_, v)| v)
            .collect()
    }
}

impl <T: Clone> Bag<T> {
    pub fn copy_items(&self) -> Vec<(BagKey, T)> {
        let mut result = self.items.iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect::<Vec<_>>();
        result.sort_by_key(|(k, _)| *k);
        result
    }
}
