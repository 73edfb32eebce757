//! Process-group membership snapshot and the per-mesh context object
//!
//! Rank and group size are fixed when the process group forms and never
//! change afterwards; a rank that becomes unreachable is a failure
//! surfaced to callers, not a membership event.

use std::sync::Arc;
use std::time::Duration;

use crate::directory::AddressDirectory;
use crate::rpc::RpcError;

/// Immutable membership snapshot for the running process group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    rank: u32,
    group_size: u32,
}

impl Membership {
    pub fn new(rank: u32, group_size: u32) -> Result<Self, RpcError> {
        if group_size == 0 {
            return Err(RpcError::Handler(
                "group size must be at least 1".to_string(),
            ));
        }
        if rank >= group_size {
            return Err(RpcError::Handler(format!(
                "rank {} out of range for group size {}",
                rank, group_size
            )));
        }
        Ok(Self { rank, group_size })
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn group_size(&self) -> u32 {
        self.group_size
    }
}

/// Shared context threaded through every RPC handler.
///
/// Holding membership, the resolved address directory, and the collective
/// parameters in one explicit object (instead of process-wide globals)
/// lets several independent mesh instances coexist in a single test
/// process.
pub struct MeshContext {
    membership: Membership,
    directory: AddressDirectory,
    tree_degree: u32,
    rpc_timeout: Duration,
}

impl MeshContext {
    pub fn new(
        membership: Membership,
        directory: AddressDirectory,
        tree_degree: u32,
        rpc_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            membership,
            directory,
            tree_degree,
            rpc_timeout,
        })
    }

    pub fn membership(&self) -> Membership {
        self.membership
    }

    pub fn rank(&self) -> u32 {
        self.membership.rank
    }

    pub fn group_size(&self) -> u32 {
        self.membership.group_size
    }

    pub fn directory(&self) -> &AddressDirectory {
        &self.directory
    }

    pub fn tree_degree(&self) -> u32 {
        self.tree_degree
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_validation() {
        assert!(Membership::new(0, 1).is_ok());
        assert!(Membership::new(3, 4).is_ok());
        assert!(Membership::new(4, 4).is_err());
        assert!(Membership::new(0, 0).is_err());
    }

    #[test]
    fn test_context_accessors() {
        let membership = Membership::new(1, 3).unwrap();
        let directory = AddressDirectory::from_endpoints(vec![
            "a:1".to_string(),
            "b:2".to_string(),
            "c:3".to_string(),
        ]);
        let ctx = MeshContext::new(membership, directory, 2, Duration::from_secs(5));

        assert_eq!(ctx.rank(), 1);
        assert_eq!(ctx.group_size(), 3);
        assert_eq!(ctx.tree_degree(), 2);
        assert_eq!(ctx.directory().resolve(2).unwrap(), "c:3");
    }
}
