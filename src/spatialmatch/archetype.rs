use indexmap::map::{Entry as IndexMapEntry, IndexMap};
use itertools::Itertools;
use ordered_float::OrderedFloat;

use crate::spatialmatch::common::{
    Archetype, ArchetypeResult, Phrasematch, PhrasematchResult, PrefixMatch, Stack,
};

/// Penalty for single-token zero-edit prefix groups with many duplicates:
/// these tend to be junk autocomplete fan-out, so their stacks rank a hair
/// below exact interpretations. Applied once, to the archetype.
const LOW_CONFIDENCE_PENALTY: f64 = 0.99;

/// Fold each result's phrasematches into archetypes keyed by
/// `(mask, weight, editMultiplier, prefix)`. Grouping preserves first-seen
/// order so downstream tie-breaks stay deterministic.
pub fn collapse(results: Vec<PhrasematchResult>) -> Vec<ArchetypeResult> {
    results
        .into_iter()
        .map(|result| {
            let mut groups: IndexMap<
                (u32, OrderedFloat<f64>, OrderedFloat<f64>, PrefixMatch),
                Archetype,
            > = IndexMap::new();
            for phrasematch in result.phrasematches {
                let group_hash = (
                    phrasematch.mask,
                    OrderedFloat(phrasematch.weight),
                    OrderedFloat(phrasematch.edit_multiplier),
                    phrasematch.prefix,
                );
                match groups.entry(group_hash) {
                    IndexMapEntry::Vacant(entry) => {
                        entry.insert(Archetype {
                            phrasematch: phrasematch.clone(),
                            exemplars: vec![phrasematch],
                        });
                    }
                    IndexMapEntry::Occupied(mut entry) => {
                        entry.get_mut().exemplars.push(phrasematch);
                    }
                }
            }

            let archetypes = groups
                .into_iter()
                .map(|(_, mut archetype)| {
                    if archetype.exemplars.len() > 2
                        && archetype.exemplars[0].subquery.len() == 1
                        && archetype.exemplars[0].edit_distance == 0
                        && archetype.phrasematch.prefix != PrefixMatch::Disabled
                    {
                        archetype.phrasematch.edit_multiplier *= LOW_CONFIDENCE_PENALTY;
                    }
                    archetype
                })
                .collect();

            ArchetypeResult {
                idx: result.idx,
                nmask: result.nmask,
                bmask: result.bmask,
                archetypes,
            }
        })
        .collect()
}

/// Expand selected archetype stacks back into phrasematch stacks: a
/// cartesian product over each stack's exemplar lists, in stack order,
/// emitted depth-first until `max_out` stacks exist. The stack's
/// relev/adjRelev carry through unchanged.
pub fn expand(stacks: Vec<Stack<&Archetype>>, max_out: usize) -> Vec<Stack<Phrasematch>> {
    let mut out: Vec<Stack<Phrasematch>> = Vec::new();
    'stacks: for stack in stacks {
        for combination in
            stack.elements.iter().map(|archetype| archetype.exemplars.iter()).multi_cartesian_product()
        {
            if out.len() >= max_out {
                break 'stacks;
            }
            out.push(Stack {
                elements: combination.into_iter().cloned().collect(),
                relev: stack.relev,
                adj_relev: stack.adj_relev,
            });
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use fixedbitset::FixedBitSet;

    fn phrasematch(mask: u32, weight: f64, subquery: &[&str]) -> Phrasematch {
        Phrasematch {
            idx: 1,
            mask,
            weight,
            edit_multiplier: 1.0,
            edit_distance: 0,
            prefix: PrefixMatch::Disabled,
            scorefactor: 1.0,
            prox_match: false,
            cat_match: false,
            partial_number: false,
            radius: None,
            zoom: 6,
            subquery: subquery.iter().map(|s| s.to_string()).collect(),
            address: None,
        }
    }

    fn result_of(phrasematches: Vec<Phrasematch>) -> PhrasematchResult {
        PhrasematchResult {
            idx: 1,
            nmask: 1,
            bmask: FixedBitSet::with_capacity(128),
            phrasematches,
        }
    }

    #[test]
    fn collapse_groups_by_stacking_key() {
        let collapsed = collapse(vec![result_of(vec![
            phrasematch(1, 0.5, &["main"]),
            phrasematch(1, 0.5, &["maine"]),
            phrasematch(2, 0.5, &["st"]),
        ])]);
        assert_eq!(collapsed[0].archetypes.len(), 2, "same (mask, weight, em, prefix) folds");
        assert_eq!(collapsed[0].archetypes[0].exemplars.len(), 2);
        assert_eq!(collapsed[0].archetypes[1].exemplars.len(), 1);
    }

    #[test]
    fn collapse_applies_low_confidence_penalty() {
        let mut members = vec![
            phrasematch(1, 0.5, &["spr"]),
            phrasematch(1, 0.5, &["spri"]),
            phrasematch(1, 0.5, &["sprin"]),
        ];
        for member in &mut members {
            member.prefix = PrefixMatch::Enabled;
        }
        let collapsed = collapse(vec![result_of(members)]);
        let archetype = &collapsed[0].archetypes[0];
        assert_eq!(
            archetype.phrasematch.edit_multiplier, 0.99,
            "three single-token zero-edit prefix exemplars earn the 0.99 penalty"
        );
        for exemplar in &archetype.exemplars {
            assert_eq!(exemplar.edit_multiplier, 1.0, "exemplars are left unpenalized");
        }
    }

    #[test]
    fn collapse_penalty_requires_all_conditions() {
        // only two exemplars
        let mut members = vec![phrasematch(1, 0.5, &["spr"]), phrasematch(1, 0.5, &["spri"])];
        for member in &mut members {
            member.prefix = PrefixMatch::Enabled;
        }
        let collapsed = collapse(vec![result_of(members)]);
        assert_eq!(collapsed[0].archetypes[0].phrasematch.edit_multiplier, 1.0);

        // prefix disabled
        let members =
            vec![phrasematch(1, 0.5, &["a"]), phrasematch(1, 0.5, &["b"]), phrasematch(1, 0.5, &["c"])];
        let collapsed = collapse(vec![result_of(members)]);
        assert_eq!(collapsed[0].archetypes[0].phrasematch.edit_multiplier, 1.0);
    }

    #[test]
    fn expand_is_a_cartesian_product() {
        let collapsed = collapse(vec![
            result_of(vec![phrasematch(1, 0.5, &["main"]), phrasematch(1, 0.5, &["maine"])]),
            result_of(vec![
                phrasematch(2, 0.5, &["st"]),
                phrasematch(2, 0.5, &["street"]),
                phrasematch(2, 0.5, &["saint"]),
            ]),
        ]);
        let stack = Stack {
            elements: vec![&collapsed[0].archetypes[0], &collapsed[1].archetypes[0]],
            relev: 1.0,
            adj_relev: 0.97,
        };
        let expanded = expand(vec![stack], 100);
        assert_eq!(expanded.len(), 6, "2 x 3 exemplars expand to 6 stacks");
        for stack in &expanded {
            assert_eq!(stack.elements.len(), 2);
            assert_eq!(stack.relev, 1.0, "stack relev survives expansion");
            assert_eq!(stack.adj_relev, 0.97, "stack adjRelev survives expansion");
        }
    }

    #[test]
    fn expand_respects_max_out() {
        let collapsed = collapse(vec![
            result_of(vec![phrasematch(1, 0.5, &["main"]), phrasematch(1, 0.5, &["maine"])]),
            result_of(vec![phrasematch(2, 0.5, &["st"]), phrasematch(2, 0.5, &["street"])]),
        ]);
        let stack = Stack {
            elements: vec![&collapsed[0].archetypes[0], &collapsed[1].archetypes[0]],
            relev: 1.0,
            adj_relev: 1.0,
        };
        assert_eq!(expand(vec![stack], 3).len(), 3);
    }
}
