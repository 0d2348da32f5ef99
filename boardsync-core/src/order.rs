/// Fractional positions for cards within a column.
///
/// A moved card gets the mean of its new neighbours' positions, so any number
/// of cards can be inserted between two others without touching their rows.
/// Each insertion into the same gap halves it; once the gap drops below float
/// resolution the column needs an explicit `renumber` pass. That pass is a
/// maintenance operation and is never run as a side effect of a move.
use crate::types::Card;

/// Position handed out when a column is empty.
pub const BASELINE_POSITION: f64 = 0.0;

/// Spacing between positions assigned by `renumber`.
pub const RENUMBER_STEP: f64 = 1.0;

/// Position for a card dropped at `target_index` of `column_sequence`.
///
/// `column_sequence` must be sorted ascending and must not contain the moved
/// card. `target_index` is the slot the card occupies after the move.
pub fn compute_position(column_sequence: &[Card], target_index: usize) -> f64 {
    let (Some(first), Some(last)) = (column_sequence.first(), column_sequence.last()) else {
        return BASELINE_POSITION;
    };
    if target_index == 0 {
        return first.order_index - 1.0;
    }
    if target_index >= column_sequence.len() {
        return last.order_index + 1.0;
    }
    let before = column_sequence[target_index - 1].order_index;
    let after = column_sequence[target_index].order_index;
    (before + after) / 2.0
}

/// Position for a new card appended to the bottom of a column.
pub fn append_position(column_sequence: &[Card]) -> f64 {
    column_sequence
        .iter()
        .map(|c| c.order_index)
        .fold(None, |max: Option<f64>, p| Some(max.map_or(p, |m| m.max(p))))
        .map_or(BASELINE_POSITION, |max| max + 1.0)
}

/// True when no usable position is left between `before` and `after`:
/// the gap is below `min_gap`, or their mean rounds onto one of them.
pub fn gap_exhausted(before: f64, after: f64, min_gap: f64) -> bool {
    let mid = (before + after) / 2.0;
    (after - before).abs() < min_gap || mid == before || mid == after
}

/// True if any adjacent pair in `column_sequence` has run out of room.
pub fn needs_renumber(column_sequence: &[Card], min_gap: f64) -> bool {
    column_sequence
        .windows(2)
        .any(|pair| gap_exhausted(pair[0].order_index, pair[1].order_index, min_gap))
}

/// Integer-spaced positions for the column's current order.
///
/// Returns `(card id, new position)` only for cards whose position changes.
pub fn renumber(column_sequence: &[Card]) -> Vec<(String, f64)> {
    column_sequence
        .iter()
        .enumerate()
        .filter_map(|(i, card)| {
            let position = BASELINE_POSITION + i as f64 * RENUMBER_STEP;
            (card.order_index != position).then(|| (card.id.clone(), position))
        })
        .collect()
}
