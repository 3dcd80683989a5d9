use std::cmp::{Ordering, Reverse};

use fixedbitset::FixedBitSet;
use ordered_float::OrderedFloat;

use crate::spatialmatch::common::{
    mask_union, masks_overlap, Archetype, ArchetypeResult, Stack,
};

struct StackableMemo<'a> {
    stacks: Vec<Stack<&'a Archetype>>,
    max_stacks: Vec<Stack<&'a Archetype>>,
    max_relev: f64,
    limit: usize,
}

/// Enumerate the combinatorially valid stacks across `results`, pruned by
/// mask/nmask/bmask compatibility. Emitted stacks keep the smallest-mask
/// element at position 0 and carry accumulated relev/adjRelev; the length
/// penalty is folded into adjRelev on the way out.
pub fn stackable<'a>(results: &'a [ArchetypeResult], limit: usize) -> Vec<Stack<&'a Archetype>> {
    if results.is_empty() {
        return Vec::new();
    }
    let mut memo =
        StackableMemo { stacks: Vec::new(), max_stacks: Vec::new(), max_relev: 0.0, limit };
    let seed = Stack::empty();
    stack_level(results, &mut memo, 0, 0, 0, &seed, 0.0, 0.0);

    let mut stacks = memo.stacks;
    stacks.extend(memo.max_stacks);
    for stack in &mut stacks {
        stack.adj_relev *= length_penalty(stack.elements.len());
    }
    stacks
}

#[inline]
fn length_penalty(len: usize) -> f64 {
    0.9 + 0.1 / (len.max(1) as f64)
}

fn stack_level<'a>(
    results: &'a [ArchetypeResult],
    memo: &mut StackableMemo<'a>,
    idx: usize,
    mask: u32,
    nmask: u32,
    stack: &Stack<&'a Archetype>,
    relev: f64,
    adj_relev: f64,
) {
    if idx + 1 < results.len() {
        stack_level(results, memo, idx + 1, mask, nmask, stack, relev, adj_relev);
    }

    let result = &results[idx];

    if nmask & result.nmask != 0 {
        return;
    }
    for element in &stack.elements {
        if result.bmask.contains(element.phrasematch.idx as usize) {
            return;
        }
    }

    for next in &result.archetypes {
        let candidate = &next.phrasematch;
        if masks_overlap(mask, candidate.mask) {
            continue;
        }
        // rightward extensions past an equal-or-higher head idx are covered
        // by the mirror traversal
        if !stack.elements.is_empty()
            && stack.elements[0].phrasematch.idx >= candidate.idx
            && mask != 0
            && mask < candidate.mask
        {
            continue;
        }

        let mut target = stack.clone();
        if candidate.mask < mask {
            target.elements.insert(0, next);
        } else {
            target.elements.push(next);
        }
        target.relev = relev + candidate.weight;
        target.adj_relev = adj_relev + candidate.weight * candidate.edit_multiplier;

        if target.relev > 0.5 {
            if target.relev > memo.max_relev {
                memo.max_relev = target.relev;
                if memo.max_stacks.len() >= memo.limit {
                    let displaced = std::mem::replace(&mut memo.max_stacks, vec![target.clone()]);
                    memo.stacks.extend(displaced);
                } else {
                    memo.max_stacks.push(target.clone());
                }
            } else if target.relev == memo.max_relev {
                memo.max_stacks.push(target.clone());
            } else if memo.stacks.len() < memo.limit {
                memo.stacks.push(target.clone());
            }
        }

        if idx + 1 < results.len() {
            stack_level(
                results,
                memo,
                idx + 1,
                mask_union(mask, candidate.mask),
                nmask | result.nmask,
                &target,
                target.relev,
                target.adj_relev,
            );
        }
    }
}

/// Keep only stacks whose highest index is allowed. No filter keeps
/// everything.
pub fn allowed<'a>(
    stacks: Vec<Stack<&'a Archetype>>,
    allowed_idx: Option<&FixedBitSet>,
) -> Vec<Stack<&'a Archetype>> {
    let filter = match allowed_idx {
        Some(filter) => filter,
        None => return stacks,
    };
    stacks
        .into_iter()
        .filter(|stack| {
            stack
                .elements
                .iter()
                .map(|element| element.phrasematch.idx)
                .max()
                .map_or(false, |max_idx| filter.contains(max_idx as usize))
        })
        .collect()
}

/// Descending-quality stack order: adjRelev, then shorter stacks, then
/// relev, then the tail element's proxMatch/catMatch/scorefactor, then a
/// per-position idx scan from the last position back.
pub fn sort_by_relev_length_idx(stacks: &mut [Stack<&Archetype>]) {
    stacks.sort_by(|a, b| {
        OrderedFloat(b.adj_relev)
            .cmp(&OrderedFloat(a.adj_relev))
            .then_with(|| a.elements.len().cmp(&b.elements.len()))
            .then_with(|| OrderedFloat(b.relev).cmp(&OrderedFloat(a.relev)))
            .then_with(|| {
                let tail_a = &a.elements[a.elements.len() - 1].phrasematch;
                let tail_b = &b.elements[b.elements.len() - 1].phrasematch;
                tail_b
                    .prox_match
                    .cmp(&tail_a.prox_match)
                    .then_with(|| tail_b.cat_match.cmp(&tail_a.cat_match))
                    .then_with(|| {
                        OrderedFloat(tail_b.scorefactor).cmp(&OrderedFloat(tail_a.scorefactor))
                    })
            })
            .then_with(|| {
                for position in (0..a.elements.len()).rev() {
                    let ord = a.elements[position]
                        .phrasematch
                        .idx
                        .cmp(&b.elements[position].phrasematch.idx);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            })
    });
}

/// Coalesce consumes layers lowest zoom first.
pub fn sort_by_zoom_idx(stack: &mut Stack<&Archetype>) {
    stack.elements.sort_by_key(|element| {
        (element.phrasematch.zoom, element.phrasematch.idx, Reverse(element.phrasematch.mask))
    });
}
