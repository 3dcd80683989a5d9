pub mod archetype;
pub mod coalesce;
pub mod common;
pub mod rebalance;
pub mod spatial;
pub mod stackable;

pub use self::common::{
    CacheCover, CacheSpatialmatch, CoalesceOpts, CoalesceSubquery, Coalescer, Cover,
    Phrasematch, PhrasematchResult, PrefixMatch, Spatialmatch, SpatialmatchError,
    SpatialmatchOpts, SpatialmatchOutput, Stack,
};

use std::collections::hash_map::Entry;

use failure::Error;
use fxhash::{FxHashMap, FxHashSet};
use log::debug;
use ordered_float::OrderedFloat;

use self::common::{MAX_INDEXES, DEFAULT_SPATIALMATCH_STACK_LIMIT, DEFAULT_STACKABLE_LIMIT};

/// Stack, rebalance, coalesce, and dedup the phrasematch candidates for one
/// query, returning the top spatial matches plus the per-feature `sets` map
/// and the `waste` debugging list.
pub fn spatialmatch<C: Coalescer + Sync>(
    query: &[String],
    phrasematch_results: Vec<PhrasematchResult>,
    opts: &SpatialmatchOpts,
    cache: &C,
) -> Result<SpatialmatchOutput, Error> {
    validate_indexes(&phrasematch_results)?;

    let stackable_limit = opts.stackable_limit.unwrap_or(DEFAULT_STACKABLE_LIMIT);
    let stack_limit =
        opts.spatialmatch_stack_limit.unwrap_or(DEFAULT_SPATIALMATCH_STACK_LIMIT);

    let collapsed = archetype::collapse(phrasematch_results);
    let stacks = stackable::stackable(&collapsed, stackable_limit);
    debug!("stackable produced {} candidate stacks", stacks.len());

    let mut stacks = stackable::allowed(stacks, opts.allowed_idx.as_ref());
    for stack in &mut stacks {
        stackable::sort_by_zoom_idx(stack);
    }
    stackable::sort_by_relev_length_idx(&mut stacks);
    stacks.truncate(stack_limit);

    let expanded = archetype::expand(stacks, stack_limit);
    let rebalanced: Vec<Stack<Phrasematch>> =
        expanded.iter().map(|stack| rebalance::rebalance(query.len(), stack)).collect();

    let (matches, waste) = coalesce::coalesce_stacks(&rebalanced, opts, cache)?;
    debug!("coalesce produced {} spatialmatches, {} wasted stacks", matches.len(), waste.len());

    let (results, sets) = finalize(matches);
    Ok(SpatialmatchOutput { results, sets, waste })
}

fn validate_indexes(results: &[PhrasematchResult]) -> Result<(), Error> {
    for result in results {
        if result.idx as usize >= MAX_INDEXES {
            return Err(SpatialmatchError::IndexOutOfRange {
                idx: result.idx,
                width: MAX_INDEXES,
            }
            .into());
        }
        for phrasematch in &result.phrasematches {
            if phrasematch.idx as usize >= MAX_INDEXES {
                return Err(SpatialmatchError::IndexOutOfRange {
                    idx: phrasematch.idx,
                    width: MAX_INDEXES,
                }
                .into());
            }
        }
    }
    Ok(())
}

/// Cross-stack dedup: after the final sort, each leading feature may emit at
/// most one descending, one ascending, and one single-layer match. `sets`
/// tracks the best cover seen for every feature, emitted or not.
pub(crate) fn finalize(
    mut matches: Vec<Spatialmatch>,
) -> (Vec<Spatialmatch>, FxHashMap<u32, Cover>) {
    matches.sort_by(|a, b| {
        OrderedFloat(b.relev)
            .cmp(&OrderedFloat(a.relev))
            .then_with(|| OrderedFloat(b.scoredist).cmp(&OrderedFloat(a.scoredist)))
            .then_with(|| a.covers[0].idx.cmp(&b.covers[0].idx))
            .then_with(|| b.address.is_some().cmp(&a.address.is_some()))
    });

    let mut sets: FxHashMap<u32, Cover> = FxHashMap::default();
    let mut done_ascending: FxHashSet<u32> = FxHashSet::default();
    let mut done_descending: FxHashSet<u32> = FxHashSet::default();
    let mut done_single: FxHashSet<u32> = FxHashSet::default();
    let mut results = Vec::new();

    for spatialmatch in matches {
        for cover in &spatialmatch.covers {
            match sets.entry(cover.tmpid) {
                Entry::Occupied(mut best) => {
                    if cover.relev > best.get().relev {
                        best.insert(cover.clone());
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(cover.clone());
                }
            }
        }

        let lead = spatialmatch.covers[0].tmpid;
        if spatialmatch.covers.len() > 1 && spatialmatch.covers[0].idx > spatialmatch.covers[1].idx
        {
            if done_descending.insert(lead) {
                results.push(spatialmatch);
            }
        } else if spatialmatch.covers.len() > 1
            && spatialmatch.covers[0].idx < spatialmatch.covers[1].idx
        {
            if done_ascending.insert(lead) {
                results.push(spatialmatch);
            }
        } else if spatialmatch.covers.len() == 1
            && !done_ascending.contains(&lead)
            && !done_descending.contains(&lead)
            && !done_single.contains(&lead)
        {
            done_single.insert(lead);
            results.push(spatialmatch);
        }
    }

    (results, sets)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gridstore::{GridEntry, MemoryGridStore};
    use fixedbitset::FixedBitSet;

    fn cover(idx: u16, tmpid: u32, relev: f64, scoredist: f64) -> Cover {
        Cover {
            x: 1,
            y: 1,
            relev,
            id: tmpid & ((1 << 25) - 1),
            idx,
            tmpid,
            distance: 0.0,
            score: 1.0,
            scoredist,
            matches_language: true,
            prefix: PrefixMatch::Disabled,
            mask: 1,
            text: "main".to_string(),
            zoom: 6,
        }
    }

    fn multi(covers: Vec<Cover>, relev: f64, scoredist: f64) -> Spatialmatch {
        Spatialmatch { relev, covers, partial_number: false, address: None, scoredist }
    }

    fn phrasematch(
        idx: u16,
        mask: u32,
        weight: f64,
        zoom: u16,
        scorefactor: f64,
        subquery: &str,
    ) -> Phrasematch {
        Phrasematch {
            idx,
            mask,
            weight,
            edit_multiplier: 1.0,
            edit_distance: 0,
            prefix: PrefixMatch::Disabled,
            scorefactor,
            prox_match: false,
            cat_match: false,
            partial_number: false,
            radius: None,
            zoom,
            subquery: vec![subquery.to_string()],
            address: None,
        }
    }

    fn result(idx: u16, nmask: u32, phrasematches: Vec<Phrasematch>) -> PhrasematchResult {
        PhrasematchResult {
            idx,
            nmask,
            bmask: FixedBitSet::with_capacity(128),
            phrasematches,
        }
    }

    #[test]
    fn direction_dedup_keeps_one_of_each() {
        let tmpid = (2 << 25) + 7;
        let descending_a =
            multi(vec![cover(2, tmpid, 0.5, 10.0), cover(1, 900, 0.5, 1.0)], 1.0, 10.0);
        let descending_b =
            multi(vec![cover(2, tmpid, 0.5, 9.0), cover(1, 901, 0.5, 1.0)], 1.0, 9.0);
        let ascending =
            multi(vec![cover(1, tmpid, 0.5, 8.0), cover(2, 902, 0.5, 1.0)], 1.0, 8.0);

        let (results, sets) = finalize(vec![descending_a, ascending, descending_b]);
        assert_eq!(results.len(), 2, "one descending and one ascending survive per tmpid");
        assert!(results[0].covers[0].idx > results[0].covers[1].idx);
        assert!(results[1].covers[0].idx < results[1].covers[1].idx);
        assert!(sets.contains_key(&tmpid));
        assert!(sets.contains_key(&900), "non-emitted covers still land in sets");
    }

    #[test]
    fn single_layer_dedups_against_all_directions() {
        let tmpid = (1 << 25) + 3;
        let descending =
            multi(vec![cover(2, tmpid, 0.5, 10.0), cover(1, 900, 0.5, 1.0)], 1.0, 10.0);
        let single = multi(vec![cover(1, tmpid, 0.4, 1.0)], 0.4, 1.0);
        let (results, _) = finalize(vec![descending, single]);
        assert_eq!(results.len(), 1, "a single is shadowed by an emitted stacked match");
    }

    #[test]
    fn sets_keeps_the_most_relevant_cover() {
        let weak = multi(vec![cover(1, 500, 0.3, 1.0)], 0.3, 1.0);
        let strong = multi(vec![cover(1, 500, 0.9, 1.0)], 0.9, 1.0);
        let (_, sets) = finalize(vec![weak, strong]);
        assert_eq!(sets[&500].relev, 0.9);
    }

    #[test]
    fn rejects_out_of_range_idx() {
        let results =
            vec![result(200, 0b1, vec![phrasematch(200, 0b1, 1.0, 6, 1.0, "main")])];
        let store = MemoryGridStore::new();
        let outcome =
            spatialmatch(&["main".to_string()], results, &SpatialmatchOpts::default(), &store);
        assert!(outcome.is_err());
    }

    #[test]
    fn pipeline_end_to_end() {
        let mut store = MemoryGridStore::new();
        store.insert(0, "springfield", vec![GridEntry { id: 1, x: 32, y: 32, relev: 1.0, score: 7 }]);
        store.insert(
            1,
            "main",
            vec![
                GridEntry { id: 2, x: 8200, y: 8200, relev: 1.0, score: 1 },
                GridEntry { id: 3, x: 100, y: 100, relev: 1.0, score: 1 },
            ],
        );

        let query = vec!["main".to_string(), "springfield".to_string()];
        let results = vec![
            result(0, 0b10, vec![phrasematch(0, 0b10, 0.5, 6, 1000.0, "springfield")]),
            result(1, 0b01, vec![phrasematch(1, 0b01, 0.5, 14, 100.0, "main")]),
        ];

        let output =
            spatialmatch(&query, results, &SpatialmatchOpts::default(), &store).unwrap();
        assert!(!output.results.is_empty());
        let best = &output.results[0];
        assert_eq!(best.covers.len(), 2, "street and place coalesce into one context");
        assert_eq!(best.covers[0].idx, 1, "the high-zoom layer leads");
        assert_eq!(best.covers[0].text, "main");
        assert_eq!(best.covers[1].text, "springfield");
        assert_eq!(best.relev, 1.0);
        assert!(output.sets.contains_key(&best.covers[0].tmpid));
        assert!(output.sets.contains_key(&best.covers[1].tmpid));
        assert!(output.waste.is_empty());
    }

    #[test]
    fn pipeline_allowed_idx_filters_everything() {
        let mut store = MemoryGridStore::new();
        store.insert(0, "springfield", vec![GridEntry { id: 1, x: 32, y: 32, relev: 1.0, score: 7 }]);
        store.insert(1, "main", vec![GridEntry { id: 2, x: 8200, y: 8200, relev: 1.0, score: 1 }]);

        let query = vec!["main".to_string(), "springfield".to_string()];
        let results = vec![
            result(0, 0b10, vec![phrasematch(0, 0b10, 0.5, 6, 1000.0, "springfield")]),
            result(1, 0b01, vec![phrasematch(1, 0b01, 0.5, 14, 100.0, "main")]),
        ];
        // only idx 0 may finish a stack; the lone viable stack peaks at idx 1
        let mut allowed_idx = FixedBitSet::with_capacity(128);
        allowed_idx.insert(0);
        let opts = SpatialmatchOpts { allowed_idx: Some(allowed_idx), ..Default::default() };

        let output = spatialmatch(&query, results, &opts, &store).unwrap();
        assert!(output.results.is_empty());
        assert!(output.sets.is_empty());
    }

    #[test]
    fn pipeline_records_waste() {
        // the only store content is for an index the query never matches
        let mut store = MemoryGridStore::new();
        store.insert(5, "elsewhere", vec![GridEntry { id: 1, x: 1, y: 1, relev: 1.0, score: 1 }]);

        let query = vec!["main".to_string()];
        let results = vec![result(1, 0b1, vec![phrasematch(1, 0b1, 1.0, 14, 100.0, "main")])];
        let output =
            spatialmatch(&query, results, &SpatialmatchOpts::default(), &store).unwrap();
        assert!(output.results.is_empty());
        assert_eq!(output.waste, vec![vec![1]], "an empty stack lands in waste by index id");
    }
}
