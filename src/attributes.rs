//! Attribute bags and the classification indexes built over them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::tile::GraphTile;

/// A canonical bag of `(key, value)` attribute pairs.
///
/// Canonical means key-sorted and duplicate-free, so two bags constructed
/// from the same pairs in any order compare and hash equal.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct AttributeSet(Vec<(String, String)>);

impl AttributeSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Builds a canonical bag from arbitrary pairs. Duplicate keys collapse
    /// to a single entry.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut entries: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        entries.sort();
        entries.reverse();
        entries.dedup_by(|a, b| a.0 == b.0);
        entries.reverse();
        Self(entries)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| self.0[i].1.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AttributeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.iter() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

/// Reduces a full attribute bag to the (typically smaller) bag that defines
/// its classification.
pub type ClassifyFn = Arc<dyn Fn(&AttributeSet) -> AttributeSet + Send + Sync>;

struct Interner {
    bags: Vec<AttributeSet>,
    ids: HashMap<AttributeSet, u32>,
}

impl Interner {
    fn intern(&mut self, bag: AttributeSet) -> u32 {
        if let Some(&id) = self.ids.get(&bag) {
            return id;
        }
        let id = self.bags.len() as u32;
        self.bags.push(bag.clone());
        self.ids.insert(bag, id);
        id
    }
}

/// Bidirectional map between classification bags and compact ids.
///
/// The classification function is immutable for the lifetime of an index;
/// replacing it goes through [`AttributeSetIndex::next`], which bumps the
/// generation so tiles written against the old index can be detected and
/// rewritten.
pub struct AttributeSetIndex {
    interner: Mutex<Interner>,
    classify: ClassifyFn,
    generation: u32,
}

impl Default for AttributeSetIndex {
    fn default() -> Self {
        Self::with_classify(Arc::new(|bag: &AttributeSet| bag.clone()))
    }
}

impl AttributeSetIndex {
    /// A generation-0 index over the given classification function.
    pub fn with_classify(classify: ClassifyFn) -> Self {
        Self {
            interner: Mutex::new(Interner {
                bags: Vec::new(),
                ids: HashMap::new(),
            }),
            classify,
            generation: 0,
        }
    }

    /// Id of the classification of `bag`, interning it if new.
    pub fn get(&self, bag: &AttributeSet) -> u32 {
        let class = (self.classify)(bag);
        self.interner.lock().intern(class)
    }

    /// The canonical bag behind `id`.
    pub fn bag(&self, id: u32) -> Option<AttributeSet> {
        self.interner.lock().bags.get(id as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.interner.lock().bags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// A new index with `classify` replaced and the generation bumped.
    ///
    /// Interned bags keep their ids, so rewriting a tile through the new
    /// index leaves records whose classification did not change untouched.
    pub fn next(&self, classify: ClassifyFn) -> Self {
        let interner = self.interner.lock();
        Self {
            interner: Mutex::new(Interner {
                bags: interner.bags.clone(),
                ids: interner.ids.clone(),
            }),
            classify,
            generation: self.generation + 1,
        }
    }

    /// Rewrites a tile so every edge-type id reflects this index.
    pub fn update(&self, tile: &GraphTile) -> GraphTile {
        tile.apply_edge_type_fn(self)
    }

    /// Seeds the interner from persisted bags, in id order.
    pub(crate) fn restore(bags: Vec<AttributeSet>, generation: u32) -> Self {
        let ids = bags
            .iter()
            .enumerate()
            .map(|(i, bag)| (bag.clone(), i as u32))
            .collect();
        Self {
            interner: Mutex::new(Interner { bags, ids }),
            classify: Arc::new(|bag: &AttributeSet| bag.clone()),
            generation,
        }
    }

    pub(crate) fn bags_snapshot(&self) -> Vec<AttributeSet> {
        self.interner.lock().bags.clone()
    }
}

impl fmt::Debug for AttributeSetIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeSetIndex")
            .field("len", &self.len())
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalization_is_order_insensitive() {
        let a = AttributeSet::from_pairs([("highway", "residential"), ("oneway", "yes")]);
        let b = AttributeSet::from_pairs([("oneway", "yes"), ("highway", "residential")]);
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_keys_collapse_to_last() {
        let bag = AttributeSet::from_pairs([("maxspeed", "30"), ("maxspeed", "50")]);
        assert_eq!(bag.len(), 1);
        assert_eq!(bag.get("maxspeed"), Some("50"));
    }

    #[test]
    fn interning_assigns_dense_stable_ids() {
        let index = AttributeSetIndex::default();
        let a = AttributeSet::from_pairs([("highway", "residential")]);
        let b = AttributeSet::from_pairs([("highway", "primary")]);
        assert_eq!(index.get(&a), 0);
        assert_eq!(index.get(&b), 1);
        assert_eq!(index.get(&a), 0);
        assert_eq!(index.bag(1), Some(b));
    }

    #[test]
    fn classification_reduces_before_interning() {
        let index = AttributeSetIndex::with_classify(Arc::new(|bag: &AttributeSet| {
            AttributeSet::from_pairs(bag.iter().filter(|(k, _)| *k == "highway"))
        }));
        let a = AttributeSet::from_pairs([("highway", "residential"), ("name", "A")]);
        let b = AttributeSet::from_pairs([("highway", "residential"), ("name", "B")]);
        assert_eq!(index.get(&a), index.get(&b));
    }

    #[test]
    fn next_preserves_ids_and_bumps_generation() {
        let index = AttributeSetIndex::default();
        let bag = AttributeSet::from_pairs([("highway", "residential")]);
        let id = index.get(&bag);

        let next = index.next(Arc::new(|bag: &AttributeSet| {
            AttributeSet::from_pairs(bag.iter().filter(|(k, _)| *k == "highway"))
        }));
        assert_eq!(next.generation(), 1);
        assert_eq!(next.get(&bag), id);
    }
}
