//! Structural properties of the k-ary collective tree, checked without
//! any networking: the parent/child formula must always yield a single
//! tree spanning all ranks, and a simulated reduction over that tree
//! must return the closed-form rank sum for every root.

use meshmark::collective::CollectiveTree;
use proptest::prelude::*;

/// Walk the tree recursively the same way the distributed reduction
/// does, summing rank values bottom-up.
fn simulated_sum(rank: u32, group_size: u32, root: u32, degree: u32) -> i64 {
    let tree = CollectiveTree::compute(rank, group_size, root, degree).unwrap();
    let mut sum = rank as i64;
    for child in tree.children {
        sum += simulated_sum(child, group_size, root, degree);
    }
    sum
}

proptest! {
    #[test]
    fn tree_spans_all_ranks(
        group_size in 1u32..64,
        root_offset in 0u32..64,
        degree in 1u32..8,
    ) {
        let root = root_offset % group_size;

        let mut parent_count = vec![0u32; group_size as usize];
        let mut reachable = vec![false; group_size as usize];

        // Walk down from the root; every rank must be visited exactly once.
        let mut stack = vec![root];
        while let Some(rank) = stack.pop() {
            prop_assert!(!reachable[rank as usize], "rank {} visited twice", rank);
            reachable[rank as usize] = true;

            let tree = CollectiveTree::compute(rank, group_size, root, degree).unwrap();
            for child in tree.children {
                parent_count[child as usize] += 1;
                stack.push(child);
            }
        }

        for rank in 0..group_size {
            prop_assert!(reachable[rank as usize], "rank {} unreachable", rank);

            let tree = CollectiveTree::compute(rank, group_size, root, degree).unwrap();
            if rank == root {
                prop_assert_eq!(tree.parent, None);
                prop_assert_eq!(parent_count[rank as usize], 0);
            } else {
                prop_assert_eq!(parent_count[rank as usize], 1);
                // The rank's own parent claims it as a child.
                let claimed = tree.parent.unwrap();
                let parent_tree =
                    CollectiveTree::compute(claimed, group_size, root, degree).unwrap();
                prop_assert!(parent_tree.children.contains(&rank));
            }
        }
    }

    #[test]
    fn simulated_reduction_matches_closed_form(
        group_size in 1u32..48,
        root_offset in 0u32..48,
        degree in 1u32..6,
    ) {
        let root = root_offset % group_size;
        let n = group_size as i64;

        let sum = simulated_sum(root, group_size, root, degree);
        prop_assert_eq!(sum, n * (n - 1) / 2);
    }
}
