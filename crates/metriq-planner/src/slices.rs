//! Slice expansion into an ordered cross-product of combinations.

use serde::{Deserialize, Serialize};

use metriq_core::spec::{SliceSpec, ALL_SENTINEL, NONE_SENTINEL, SLICE_SEPARATOR};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceCombination {
    /// Pipe-joined slice names, or `none`.
    pub slice_type: String,
    /// Pipe-joined value names, or `all`.
    pub slice_value: String,
    /// `(slice index, value index)` per constituent, in slice order. Empty
    /// for the sentinel combination, whose predicate is always true.
    pub members: Vec<(usize, usize)>,
}

impl SliceCombination {
    pub fn sentinel() -> Self {
        Self {
            slice_type: NONE_SENTINEL.to_string(),
            slice_value: ALL_SENTINEL.to_string(),
            members: Vec::new(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.members.is_empty()
    }
}

/// Expand slices into Π(cᵢ) combinations, first slice varying slowest and
/// values in declared order. Zero slices yield the single sentinel
/// combination; a slice with no values yields nothing (the planner rejects
/// that case before expanding).
pub fn expand(slices: &[SliceSpec]) -> Vec<SliceCombination> {
    if slices.is_empty() {
        return vec![SliceCombination::sentinel()];
    }

    let counts: Vec<usize> = slices.iter().map(|s| s.values.len()).collect();
    let total: usize = counts.iter().product();
    let sep = SLICE_SEPARATOR.to_string();
    let slice_type = slices
        .iter()
        .map(|s| s.name.as_str())
        .collect::<Vec<_>>()
        .join(&sep);

    let mut out = Vec::with_capacity(total);
    let mut idx = vec![0usize; slices.len()];
    for _ in 0..total {
        let members: Vec<(usize, usize)> = idx.iter().copied().enumerate().collect();
        let slice_value = members
            .iter()
            .map(|&(s, v)| slices[s].values[v].name.as_str())
            .collect::<Vec<_>>()
            .join(&sep);
        out.push(SliceCombination {
            slice_type: slice_type.clone(),
            slice_value,
            members,
        });

        // Odometer: the last slice turns fastest.
        for pos in (0..idx.len()).rev() {
            idx[pos] += 1;
            if idx[pos] < counts[pos] {
                break;
            }
            idx[pos] = 0;
        }
    }
    out
}
