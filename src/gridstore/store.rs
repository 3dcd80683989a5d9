use std::cmp::Reverse;

use fxhash::FxHashMap;
use ordered_float::OrderedFloat;

use crate::gridstore::common::GridEntry;
use crate::spatialmatch::common::CoalesceSubquery;

/// An in-process grid cache keyed by `(index, phrase)`. Entries are kept
/// sorted best-first by `(relev, score, id)`, the order `coalesce_single`
/// relies on. The persistent engine sits behind the same `Coalescer` seam.
#[derive(Debug, Default)]
pub struct MemoryGridStore {
    grids: FxHashMap<u16, FxHashMap<String, Vec<GridEntry>>>,
}

impl MemoryGridStore {
    pub fn new() -> MemoryGridStore {
        MemoryGridStore { grids: FxHashMap::default() }
    }

    pub fn insert(&mut self, idx: u16, phrase: &str, mut entries: Vec<GridEntry>) {
        entries.sort_by_key(|entry| Reverse((OrderedFloat(entry.relev), entry.score, entry.id)));
        self.grids.entry(idx).or_insert_with(FxHashMap::default).insert(phrase.to_string(), entries);
    }

    pub(crate) fn matching(&self, subquery: &CoalesceSubquery) -> &[GridEntry] {
        self.grids
            .get(&subquery.idx)
            .and_then(|phrases| phrases.get(subquery.phrase.as_str()))
            .map(|entries| entries.as_slice())
            .unwrap_or(&[])
    }
}
