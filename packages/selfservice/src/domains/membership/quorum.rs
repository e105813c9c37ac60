//! Approval quorum rule.

use std::collections::HashSet;

use crate::common::UserId;
use crate::domains::membership::models::MembershipApproval;

/// Decides when a membership application has gathered enough approvals.
///
/// Quorum is a single approval from a user who is currently an active member
/// of the target capability: someone already inside vouches for you. This is
/// deliberate business policy, not a placeholder for N-of-M voting.
///
/// The policy is stateless and pure; the capability's member set is queried
/// by the service and passed in, which keeps the aggregate ignorant of
/// capability membership.
pub struct ApprovalQuorumPolicy;

impl ApprovalQuorumPolicy {
    pub fn is_quorum_met(
        active_member_ids: &HashSet<UserId>,
        approvals: &[MembershipApproval],
    ) -> bool {
        approvals
            .iter()
            .any(|approval| active_member_ids.contains(&approval.approved_by))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn approval_by(user: &str) -> MembershipApproval {
        MembershipApproval {
            approved_by: UserId::new(user),
            approved_at: Utc::now(),
        }
    }

    fn members(users: &[&str]) -> HashSet<UserId> {
        users.iter().map(|u| UserId::new(*u)).collect()
    }

    #[test]
    fn test_no_approvals_is_not_quorum() {
        assert!(!ApprovalQuorumPolicy::is_quorum_met(
            &members(&["bob@acme.co"]),
            &[]
        ));
    }

    #[test]
    fn test_single_member_approval_meets_quorum() {
        assert!(ApprovalQuorumPolicy::is_quorum_met(
            &members(&["bob@acme.co", "carol@acme.co"]),
            &[approval_by("bob@acme.co")]
        ));
    }

    #[test]
    fn test_approval_from_non_member_does_not_count() {
        assert!(!ApprovalQuorumPolicy::is_quorum_met(
            &members(&["bob@acme.co"]),
            &[approval_by("mallory@acme.co")]
        ));
    }

    #[test]
    fn test_mixed_approvals_count_only_members() {
        assert!(ApprovalQuorumPolicy::is_quorum_met(
            &members(&["bob@acme.co"]),
            &[approval_by("mallory@acme.co"), approval_by("bob@acme.co")]
        ));
    }

    #[test]
    fn test_empty_member_set_never_meets_quorum() {
        assert!(!ApprovalQuorumPolicy::is_quorum_met(
            &HashSet::new(),
            &[approval_by("bob@acme.co")]
        ));
    }
}
