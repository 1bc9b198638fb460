//! Spatially-interleaved load order.
//!
//! The grid is split into four disjoint parity batches. The first batch
//! (odd, odd) is a dispersed checkerboard-of-checkerboards: no two of its
//! tiles are 4-neighbors, so the viewer paints a coarse impression of the
//! whole image before the remaining batches fill the gaps.

/// Enumerate the `cols` x `rows` grid as four parity batches, in load order:
/// (odd, odd), (even, even), (odd, even), (even, odd). Each batch is
/// row-major, so the order is stable for a given grid.
pub fn parity_batches(cols: u32, rows: u32) -> [Vec<(u32, u32)>; 4] {
    let mut batches: [Vec<(u32, u32)>; 4] = [Vec::new(), Vec::new(), Vec::new(), Vec::new()];
    for cy in 0..rows {
        for cx in 0..cols {
            let batch = match (cx % 2 == 1, cy % 2 == 1) {
                (true, true) => 0,
                (false, false) => 1,
                (true, false) => 2,
                (false, true) => 3,
            };
            batches[batch].push((cx, cy));
        }
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn batches_cover_the_grid_exactly_once() {
        for (cols, rows) in [(1, 1), (2, 2), (3, 1), (5, 4), (7, 7)] {
            let batches = parity_batches(cols, rows);
            let mut seen = HashSet::new();
            for batch in &batches {
                for &id in batch {
                    assert!(seen.insert(id), "duplicate chunk {:?}", id);
                }
            }
            assert_eq!(seen.len() as u32, cols * rows);
            for cx in 0..cols {
                for cy in 0..rows {
                    assert!(seen.contains(&(cx, cy)));
                }
            }
        }
    }

    #[test]
    fn first_batch_has_no_four_neighbors() {
        let batches = parity_batches(9, 6);
        let first = &batches[0];
        for &(ax, ay) in first.iter() {
            for &(bx, by) in first.iter() {
                let manhattan = ax.abs_diff(bx) + ay.abs_diff(by);
                assert_ne!(manhattan, 1, "({},{}) and ({},{}) touch", ax, ay, bx, by);
            }
        }
    }

    #[test]
    fn two_by_two_grid_matches_the_expected_order() {
        let batches = parity_batches(2, 2);
        assert_eq!(batches[0], vec![(1, 1)]);
        assert_eq!(batches[1], vec![(0, 0)]);
        assert_eq!(batches[2], vec![(1, 0)]);
        assert_eq!(batches[3], vec![(0, 1)]);
    }

    #[test]
    fn single_row_grid_alternates_between_two_batches() {
        let batches = parity_batches(4, 1);
        assert!(batches[0].is_empty()); // no odd rows
        assert_eq!(batches[1], vec![(0, 0), (2, 0)]);
        assert_eq!(batches[2], vec![(1, 0), (3, 0)]);
        assert!(batches[3].is_empty());
    }

    #[test]
    fn batch_order_is_stable() {
        assert_eq!(parity_batches(5, 3), parity_batches(5, 3));
    }
}
