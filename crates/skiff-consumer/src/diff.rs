use std::collections::HashSet;

use skiff_core::QueueId;

/// Queues of `left` that are not in `right`, by value, in `left`'s order.
pub fn subtract(left: &[QueueId], right: &[QueueId]) -> Vec<QueueId> {
    let right: HashSet<&QueueId> = right.iter().collect();
    left.iter()
        .filter(|queue| !right.contains(queue))
        .cloned()
        .collect()
}
