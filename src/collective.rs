//! K-ary collective tree topology and the fan-out/fan-in sum reduction
//!
//! Every participating process derives only its own parent and children
//! from `(rank, group_size, root, degree)`; no global tree object is ever
//! built or broadcast. Re-rooting works on relative ranks: subtract the
//! root (mod N) so the root always sits at relative rank 0, then map
//! relative ranks back by adding the root (mod N).

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::membership::MeshContext;
use crate::rpc::client::RpcClient;
use crate::rpc::peer_ops::{PeerSum, PeerSumRequest};
use crate::rpc::RpcError;

/// The local process's view of one collective tree: its parent (none for
/// the root) and its children, all as absolute ranks.
///
/// Recomputed per collective invocation; never cached across invocations
/// with different roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectiveTree {
    pub parent: Option<u32>,
    pub children: Vec<u32>,
}

impl CollectiveTree {
    /// Compute the k-ary tree position of `rank` in a tree of
    /// `group_size` ranks rooted at `root` with fan-out `degree`.
    pub fn compute(
        rank: u32,
        group_size: u32,
        root: u32,
        degree: u32,
    ) -> Result<Self, RpcError> {
        if group_size == 0 {
            return Err(RpcError::Handler("empty group".to_string()));
        }
        if degree == 0 {
            return Err(RpcError::Handler("tree degree must be >= 1".to_string()));
        }
        if rank >= group_size || root >= group_size {
            return Err(RpcError::Handler(format!(
                "rank {} / root {} out of range for group size {}",
                rank, root, group_size
            )));
        }

        let n = group_size as u64;
        let k = degree as u64;
        // Re-root the numbering so the root is relative rank 0.
        let rel = (rank as u64 + n - root as u64) % n;

        let parent = if rel == 0 {
            None
        } else {
            let parent_rel = (rel - 1) / k;
            Some(((parent_rel + root as u64) % n) as u32)
        };

        let mut children = Vec::new();
        for i in 1..=k {
            let child_rel = rel * k + i;
            if child_rel >= n {
                break;
            }
            children.push(((child_rel + root as u64) % n) as u32);
        }

        Ok(Self { parent, children })
    }
}

/// Result of one sum collective as seen by the initiating node.
#[derive(Debug, Clone, Copy)]
pub struct SumResult {
    pub sum: i32,
    pub elapsed: Duration,
}

/// One hop of the recursive sum reduction.
///
/// Computes this node's children for the tree rooted at `root`, forwards
/// the request to every child concurrently, waits for all of them, and
/// returns the children's partial sums plus this node's own contribution
/// of `seed + rank`. A single child failure aborts the whole hop; a
/// partial sum is never substituted.
pub async fn reduce_sum(
    ctx: &Arc<MeshContext>,
    root: u32,
    degree: u32,
    seed: i32,
    budget: Duration,
) -> Result<i32, RpcError> {
    let started = Instant::now();

    let tree = CollectiveTree::compute(ctx.rank(), ctx.group_size(), root, degree)?;

    tracing::debug!(
        "reduce_sum: rank={} root={} seed={} parent={:?} children={:?}",
        ctx.rank(),
        root,
        seed,
        tree.parent,
        tree.children
    );

    // Leaf: own contribution only, zero forwards.
    if tree.children.is_empty() {
        return Ok(seed + ctx.rank() as i32);
    }

    // Fan out one asynchronous forward per child, then wait for all of
    // them. Completion order is irrelevant; aggregation must not start
    // until every child has answered. Each forward's own deadline is the
    // budget left at issue time, the same figure handed to the child.
    let mut pending = Vec::with_capacity(tree.children.len());
    for &child in &tree.children {
        let endpoint = ctx.directory().resolve(child)?.to_string();
        let budget_left = remaining(budget, started);
        let request = PeerSumRequest {
            root: root as i32,
            degree: degree as i32,
            seed,
            pad: 0,
            budget_usec: budget_left.as_micros() as u64,
        };
        let client = RpcClient::new(budget_left);
        pending.push((child, client.forward_async::<PeerSum>(endpoint, request)));
    }

    let replies = futures::future::join_all(
        pending
            .into_iter()
            .map(|(child, reply)| async move { (child, reply.wait().await) }),
    )
    .await;

    let mut sum = seed + ctx.rank() as i32;
    for (child, result) in replies {
        let response = result.map_err(|e| {
            RpcError::Handler(format!("sum forward to child rank {} failed: {}", child, e))
        })?;
        if response.ret != 0 {
            return Err(RpcError::Handler(format!(
                "child rank {} reported sum failure (ret={})",
                child, response.ret
            )));
        }
        sum += response.sum;
    }

    Ok(sum)
}

/// Initiate a sum collective rooted at this node and time it.
pub async fn initiate_sum(ctx: &Arc<MeshContext>, seed: i32) -> Result<SumResult, RpcError> {
    let started = Instant::now();
    let sum = reduce_sum(ctx, ctx.rank(), ctx.tree_degree(), seed, ctx.rpc_timeout()).await?;

    Ok(SumResult {
        sum,
        elapsed: started.elapsed(),
    })
}

fn remaining(budget: Duration, started: Instant) -> Duration {
    budget.saturating_sub(started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::AddressDirectory;
    use crate::membership::Membership;

    #[tokio::test]
    async fn test_leaf_contributes_seed_plus_rank() {
        let ctx = MeshContext::new(
            Membership::new(0, 1).unwrap(),
            AddressDirectory::from_endpoints(vec!["127.0.0.1:0".to_string()]),
            2,
            Duration::from_secs(5),
        );

        let sum = reduce_sum(&ctx, 0, 2, 100, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(sum, 100);
    }

    #[tokio::test]
    async fn test_reduce_fails_within_budget_on_silent_child() {
        // A child that accepts the connection but never responds must
        // stall the parent only until the budget runs out, not longer.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((stream, _)) = listener.accept().await {
                    held.push(stream);
                }
            }
        });

        let ctx = MeshContext::new(
            Membership::new(0, 2).unwrap(),
            AddressDirectory::from_endpoints(vec!["127.0.0.1:0".to_string(), addr]),
            2,
            Duration::from_secs(5),
        );

        let started = Instant::now();
        let result = reduce_sum(&ctx, 0, 2, 0, Duration::from_millis(100)).await;

        assert!(result.is_err());
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "reduce overran its budget: {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn test_single_rank_tree() {
        let tree = CollectiveTree::compute(0, 1, 0, 2).unwrap();
        assert_eq!(tree.parent, None);
        assert!(tree.children.is_empty());
    }

    #[test]
    fn test_binary_tree_rooted_at_zero() {
        // N=4, k=2, root=0: 0 -> {1,2}, 1 -> {3}, 2 and 3 are leaves.
        let t0 = CollectiveTree::compute(0, 4, 0, 2).unwrap();
        assert_eq!(t0.parent, None);
        assert_eq!(t0.children, vec![1, 2]);

        let t1 = CollectiveTree::compute(1, 4, 0, 2).unwrap();
        assert_eq!(t1.parent, Some(0));
        assert_eq!(t1.children, vec![3]);

        let t2 = CollectiveTree::compute(2, 4, 0, 2).unwrap();
        assert_eq!(t2.parent, Some(0));
        assert!(t2.children.is_empty());

        let t3 = CollectiveTree::compute(3, 4, 0, 2).unwrap();
        assert_eq!(t3.parent, Some(1));
        assert!(t3.children.is_empty());
    }

    #[test]
    fn test_rerooted_tree() {
        // N=5, k=2, root=2: absolute rank 4 has relative rank
        // (4-2+5)%5 = 2; its children would be relative {5,6}, both >= 5,
        // so it is a leaf.
        let t4 = CollectiveTree::compute(4, 5, 2, 2).unwrap();
        assert!(t4.children.is_empty());

        // The root's children are relative {1,2} -> absolute {3,4}.
        let t2 = CollectiveTree::compute(2, 5, 2, 2).unwrap();
        assert_eq!(t2.parent, None);
        assert_eq!(t2.children, vec![3, 4]);

        // Rank 4's parent is relative (2-1)/2 = 0 -> absolute 2.
        assert_eq!(t4.parent, Some(2));
    }

    #[test]
    fn test_degree_one_is_a_chain() {
        for rank in 0..4u32 {
            let t = CollectiveTree::compute(rank, 4, 0, 1).unwrap();
            if rank == 0 {
                assert_eq!(t.parent, None);
            } else {
                assert_eq!(t.parent, Some(rank - 1));
            }
            if rank == 3 {
                assert!(t.children.is_empty());
            } else {
                assert_eq!(t.children, vec![rank + 1]);
            }
        }
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(CollectiveTree::compute(0, 0, 0, 2).is_err());
        assert!(CollectiveTree::compute(0, 4, 0, 0).is_err());
        assert!(CollectiveTree::compute(4, 4, 0, 2).is_err());
        assert!(CollectiveTree::compute(0, 4, 4, 2).is_err());
    }

    #[test]
    fn test_children_list_their_parent() {
        for n in 1..20u32 {
            for root in [0, n / 2, n - 1] {
                for k in 1..4u32 {
                    for rank in 0..n {
                        let t = CollectiveTree::compute(rank, n, root, k).unwrap();
                        for &child in &t.children {
                            let ct = CollectiveTree::compute(child, n, root, k).unwrap();
                            assert_eq!(
                                ct.parent,
                                Some(rank),
                                "child {} of {} (n={}, root={}, k={})",
                                child,
                                rank,
                                n,
                                root,
                                k
                            );
                        }
                    }
                }
            }
        }
    }
}
