use failure::Error;
use fxhash::FxHashMap;
use rayon::prelude::*;

use crate::spatialmatch::common::{
    CoalesceOpts, CoalesceSubquery, Coalescer, Phrasematch, Spatialmatch, SpatialmatchOpts,
    Stack, DEFAULT_PROXIMITY_RADIUS, PARTIAL_NUMBER_RADIUS_MILES,
};
use crate::spatialmatch::spatial;

/// Map user proximity/bbox options onto tile coordinates for one stack.
/// `None` means the stack cannot produce results (its partial-number bbox
/// does not intersect the requested bbox).
fn build_coalesce_opts(
    stack: &Stack<Phrasematch>,
    opts: &SpatialmatchOpts,
) -> Result<Option<CoalesceOpts>, Error> {
    let mut coalesce_opts = CoalesceOpts::default();
    let tail = &stack.elements[stack.elements.len() - 1];

    if let Some(proximity) = opts.proximity {
        let max_zoom = stack.elements.iter().map(|element| element.zoom).max().unwrap_or(0);
        coalesce_opts.centerzxy = Some(spatial::proximity_center(proximity, max_zoom)?);
        coalesce_opts.radius = Some(tail.radius.unwrap_or(DEFAULT_PROXIMITY_RADIUS));
    }

    if tail.partial_number && opts.proximity.is_some() {
        let pn_bbox = spatial::partial_number_bbox(
            opts.proximity.expect("proximity checked above"),
            PARTIAL_NUMBER_RADIUS_MILES,
        );
        let merged = match opts.bbox {
            Some(bbox) => spatial::bbox_intersection(pn_bbox, bbox),
            None => Some(pn_bbox),
        };
        match merged {
            Some(bbox) => {
                coalesce_opts.bboxzxy = Some(spatial::inside_tile(bbox, stack.elements[0].zoom)?)
            }
            None => return Ok(None),
        }
    } else if let Some(bbox) = opts.bbox {
        coalesce_opts.bboxzxy = Some(spatial::inside_tile(bbox, stack.elements[0].zoom)?);
    }

    Ok(Some(coalesce_opts))
}

fn coalesce_stack<C: Coalescer>(
    stack: &Stack<Phrasematch>,
    opts: &SpatialmatchOpts,
    cache: &C,
) -> Result<Vec<Spatialmatch>, Error> {
    if stack.elements.is_empty() {
        return Ok(Vec::new());
    }
    let coalesce_opts = match build_coalesce_opts(stack, opts)? {
        Some(coalesce_opts) => coalesce_opts,
        None => return Ok(Vec::new()),
    };

    let subqueries: Vec<CoalesceSubquery> = stack
        .elements
        .iter()
        .map(|element| CoalesceSubquery {
            idx: element.idx,
            zoom: element.zoom,
            mask: element.mask,
            weight: element.weight,
            phrase: element.subquery.join(" "),
        })
        .collect();

    let matches = cache.coalesce(&subqueries, &coalesce_opts)?;

    let mut stack_by_idx: FxHashMap<u16, &Phrasematch> = FxHashMap::default();
    for element in &stack.elements {
        stack_by_idx.insert(element.idx, element);
    }
    let partial_number =
        stack.elements[stack.elements.len() - 1].partial_number;
    let address =
        stack.elements.iter().find_map(|element| element.address.clone());

    matches
        .iter()
        .map(|cached| Spatialmatch::new(cached, &stack_by_idx, partial_number, address.clone()))
        .collect()
}

/// Run coalesce across all rebalanced stacks in parallel. Stacks that
/// produce nothing land in `waste` as their index-id lists; the first error
/// observed fails the whole query.
pub fn coalesce_stacks<C: Coalescer + Sync>(
    stacks: &[Stack<Phrasematch>],
    opts: &SpatialmatchOpts,
    cache: &C,
) -> Result<(Vec<Spatialmatch>, Vec<Vec<u16>>), Error> {
    let per_stack: Vec<Vec<Spatialmatch>> = stacks
        .par_iter()
        .map(|stack| coalesce_stack(stack, opts, cache))
        .collect::<Result<Vec<_>, Error>>()?;

    let mut matches = Vec::new();
    let mut waste = Vec::new();
    for (stack, outcome) in stacks.iter().zip(per_stack) {
        if outcome.is_empty() {
            waste.push(stack.elements.iter().map(|element| element.idx).collect());
        } else {
            matches.extend(outcome);
        }
    }
    Ok((matches, waste))
}
