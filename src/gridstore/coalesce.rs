use std::collections::hash_map::Entry;

use failure::Error;
use fxhash::{FxHashMap, FxHashSet};
use itertools::Itertools;

use crate::gridstore::common::{
    CoalesceContext, CoalesceEntry, ConstrainedPriorityQueue, GridEntry, MAX_CONTEXTS,
    MAX_GRIDS_PER_PHRASE,
};
use crate::gridstore::store::MemoryGridStore;
use crate::spatialmatch::common::{
    CacheCover, CacheSpatialmatch, CoalesceOpts, CoalesceSubquery, Coalescer, SpatialmatchError,
    TileBounds, DEFAULT_PROXIMITY_RADIUS,
};
use crate::spatialmatch::spatial::EARTH_CIRCUMFERENCE_MILES;

impl Coalescer for MemoryGridStore {
    /// Intersect tile covers across the stack's layers, returning sorted
    /// multi-layer matches windowed to the top contexts.
    fn coalesce(
        &self,
        stack: &[CoalesceSubquery],
        opts: &CoalesceOpts,
    ) -> Result<Vec<CacheSpatialmatch>, Error> {
        if stack.is_empty() {
            return Err(SpatialmatchError::InvalidOptions("empty coalesce stack").into());
        }
        let contexts = if stack.len() == 1 {
            coalesce_single(self, &stack[0], opts)
        } else {
            coalesce_multi(self, stack, opts)
        };
        Ok(window_contexts(contexts))
    }
}

/// Raw proximity scoredist: grows as the feature nears the center, never
/// drops below the raw score, and clears the 3-bit ceiling inside the
/// radius so the linear decoding branch engages downstream.
pub fn scoredist(zoom: u16, distance: f64, score: u8, radius: f64) -> f64 {
    let distance = if distance == 0.0 { 0.01 } else { distance };
    let miles_per_tile = EARTH_CIRCUMFERENCE_MILES / f64::from(1u32 << zoom.min(30));
    let radius_tiles = radius / miles_per_tile;
    let score = f64::from(score.min(7));
    ((radius_tiles / distance) * (score + 1.0)).max(score)
}

fn in_bounds(x: u32, y: u32, zoom: u16, bboxzxy: &Option<Vec<TileBounds>>) -> bool {
    match bboxzxy {
        None => true,
        Some(bounds) => bounds.iter().any(|bound| bound.at_zoom(zoom).contains(x, y)),
    }
}

fn grid_to_coalesce_entry(
    grid: &GridEntry,
    subquery: &CoalesceSubquery,
    opts: &CoalesceOpts,
) -> CoalesceEntry {
    let relevance = grid.relev * subquery.weight;
    let (distance, scoredist) = match &opts.centerzxy {
        Some(center) => {
            let center = center.at_zoom(subquery.zoom);
            let dx = f64::from(grid.x) - f64::from(center.x);
            let dy = f64::from(grid.y) - f64::from(center.y);
            let distance = (dx * dx + dy * dy).sqrt();
            let radius = opts.radius.unwrap_or(DEFAULT_PROXIMITY_RADIUS);
            (distance, self::scoredist(subquery.zoom, distance, grid.score, radius))
        }
        None => (0.0, f64::from(grid.score)),
    };

    CoalesceEntry {
        mask: subquery.mask,
        cover: CacheCover {
            x: grid.x,
            y: grid.y,
            idx: subquery.idx,
            id: grid.id,
            tmpid: (u32::from(subquery.idx) << 25) + grid.id,
            relev: relevance,
            distance,
            score: grid.score,
            scoredist,
            matches_language: true,
        },
    }
}

fn coalesce_single(
    store: &MemoryGridStore,
    subquery: &CoalesceSubquery,
    opts: &CoalesceOpts,
) -> Vec<CoalesceContext> {
    let mut coalesced: FxHashMap<u32, CoalesceEntry> = FxHashMap::default();

    for grid in store.matching(subquery).iter().take(MAX_GRIDS_PER_PHRASE) {
        if !in_bounds(grid.x, grid.y, subquery.zoom, &opts.bboxzxy) {
            continue;
        }
        let coalesce_entry = grid_to_coalesce_entry(grid, subquery, opts);

        // same feature in more than one tile: keep the better surface
        match coalesced.entry(coalesce_entry.cover.id) {
            Entry::Occupied(mut already_coalesced) => {
                if coalesce_entry.cover.scoredist > already_coalesced.get().cover.scoredist
                    && coalesce_entry.cover.relev >= already_coalesced.get().cover.relev
                {
                    already_coalesced.insert(coalesce_entry);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(coalesce_entry);
            }
        }
    }

    let mut contexts: Vec<CoalesceContext> = coalesced
        .into_iter()
        .map(|(_, entry)| CoalesceContext {
            relev: entry.cover.relev,
            mask: entry.mask,
            entries: vec![entry],
        })
        .collect();

    contexts.sort_by(|a, b| b.cmp(a));
    contexts
}

fn coalesce_multi(
    store: &MemoryGridStore,
    stack: &[CoalesceSubquery],
    opts: &CoalesceOpts,
) -> Vec<CoalesceContext> {
    let mut stack: Vec<CoalesceSubquery> = stack.to_vec();
    stack.sort_by_key(|subquery| (subquery.zoom, subquery.idx));

    let mut coalesced: FxHashMap<(u16, u32, u32), Vec<CoalesceContext>> = FxHashMap::default();
    let mut contexts: Vec<CoalesceContext> = Vec::new();
    let mut max_relevance: f64 = 0.;

    for (i, subquery) in stack.iter().enumerate() {
        let mut to_add_to_coalesced: FxHashMap<(u16, u32, u32), Vec<CoalesceContext>> =
            FxHashMap::default();
        let compatible_zooms: Vec<u16> = stack
            .iter()
            .filter_map(|other| {
                if subquery.idx == other.idx || subquery.zoom < other.zoom {
                    None
                } else {
                    Some(other.zoom)
                }
            })
            .dedup()
            .collect();

        for grid in store.matching(subquery).iter().take(MAX_GRIDS_PER_PHRASE) {
            if !in_bounds(grid.x, grid.y, subquery.zoom, &opts.bboxzxy) {
                continue;
            }
            let coalesce_entry = grid_to_coalesce_entry(grid, subquery, opts);
            let zxy = (subquery.zoom, grid.x, grid.y);

            let mut context_mask = coalesce_entry.mask;
            let mut context_relevance = coalesce_entry.cover.relev;
            let mut entries: Vec<CoalesceEntry> = vec![coalesce_entry];

            // stack onto anything coalesced at a compatible lower zoom:
            // "zoom out" by dividing by 2^(difference in zooms)
            for other_zoom in compatible_zooms.iter() {
                let scale_factor: u32 = 1 << (subquery.zoom - *other_zoom);
                let other_zxy = (
                    *other_zoom,
                    entries[0].cover.x / scale_factor,
                    entries[0].cover.y / scale_factor,
                );

                if let Some(already_coalesced) = coalesced.get(&other_zxy) {
                    let mut prev_mask = 0;
                    let mut prev_relev: f64 = 0.;
                    for parent_context in already_coalesced {
                        for parent_entry in &parent_context.entries {
                            // a cover functionally identical with the
                            // previous one but more relevant replaces it
                            if parent_entry.mask == prev_mask
                                && parent_entry.cover.relev > prev_relev
                            {
                                entries.pop();
                                entries.push(parent_entry.clone());
                                context_relevance -= prev_relev;
                                context_relevance += parent_entry.cover.relev;

                                prev_mask = parent_entry.mask;
                                prev_relev = parent_entry.cover.relev;
                            } else if context_mask & parent_entry.mask == 0 {
                                entries.push(parent_entry.clone());

                                context_relevance += parent_entry.cover.relev;
                                context_mask |= parent_entry.mask;

                                prev_mask = parent_entry.mask;
                                prev_relev = parent_entry.cover.relev;
                            }
                        }
                    }
                }
            }
            if context_relevance > max_relevance {
                max_relevance = context_relevance;
            }

            if i == stack.len() - 1 {
                if entries.len() == 1 {
                    // slightly penalize contexts that have no stacking
                    context_relevance -= 0.01;
                } else if entries[0].mask > entries[1].mask {
                    // slightly penalize contexts in ascending order
                    context_relevance -= 0.01;
                }

                if max_relevance - context_relevance < 0.25 {
                    contexts.push(CoalesceContext {
                        entries,
                        mask: context_mask,
                        relev: context_relevance,
                    });
                }
            } else if i == 0 || entries.len() > 1 {
                to_add_to_coalesced
                    .entry(zxy)
                    .or_insert_with(Vec::new)
                    .push(CoalesceContext {
                        entries,
                        mask: context_mask,
                        relev: context_relevance,
                    });
            }
        }
        for (to_add_zxy, to_add_contexts) in to_add_to_coalesced {
            coalesced.entry(to_add_zxy).or_insert_with(Vec::new).extend(to_add_contexts);
        }
    }

    let mut queue: ConstrainedPriorityQueue<CoalesceContext> =
        ConstrainedPriorityQueue::new(MAX_CONTEXTS * 20);
    for context in contexts {
        queue.push(context);
    }
    for (_, matched) in coalesced {
        for context in matched {
            if max_relevance - context.relev < 0.25 {
                queue.push(context);
            }
        }
    }

    queue.into_vec_desc()
}

fn window_contexts(contexts: Vec<CoalesceContext>) -> Vec<CacheSpatialmatch> {
    let mut out = Vec::with_capacity(MAX_CONTEXTS);
    if contexts.is_empty() {
        return out;
    }
    let max_relevance = contexts[0].relev;
    let mut seen: FxHashSet<u32> = FxHashSet::default();
    for context in contexts {
        if out.len() >= MAX_CONTEXTS {
            break;
        }
        // 0.25 is the largest allowed relevance drop
        if max_relevance - context.relev >= 0.25 {
            break;
        }
        if seen.insert(context.entries[0].cover.tmpid) {
            out.push(context.into());
        }
    }
    out
}
