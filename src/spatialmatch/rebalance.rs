use crate::spatialmatch::common::{Phrasematch, Stack};

/// Half-away-from-zero rounding to 8 decimal places. Relevance arithmetic
/// rounds at the edges of rebalance only; intermediates stay native f64.
pub fn round8(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

/// Recompute per-element weights so longer stacks are neither unfairly
/// advantaged nor disadvantaged. A stack that fails to cover every query
/// token carries one token of garbage. Elements are cloned, so the
/// pre-rebalance stack never aliases the result.
pub fn rebalance(query_len: usize, stack: &Stack<Phrasematch>) -> Stack<Phrasematch> {
    let stack_mask =
        stack.elements.iter().fold(0u32, |mask, element| mask | element.mask);
    let garbage = if stack_mask.count_ones() as usize == query_len { 0.0 } else { 1.0 };

    let total_length_bonus = 0.01 * (garbage + stack.elements.len() as f64);
    let weight_per_match = 1.0 / (garbage + stack.elements.len() as f64) - 0.01;

    let mut elements = Vec::with_capacity(stack.elements.len());
    let mut relev = 0.0;
    for element in &stack.elements {
        let mut rebalanced = element.clone();
        rebalanced.weight = round8(
            (weight_per_match + total_length_bonus * element.weight) * element.edit_multiplier,
        );
        relev += rebalanced.weight;
        elements.push(rebalanced);
    }

    Stack { elements, relev: round8(relev).min(1.0), adj_relev: stack.adj_relev }
}
