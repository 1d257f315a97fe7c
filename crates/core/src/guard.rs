//! Authorization predicates evaluated inline by the services.
//!
//! The guard knows nothing about jobs or applications; callers hand it the
//! identifiers and roles that matter for the action being attempted.

use thiserror::Error;
use uuid::Uuid;

use crate::types::{Identity, Role};

/// Reason an action was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Denied {
    #[error("role {actual} is not permitted to perform this action")]
    Role { actual: Role },
    #[error("caller does not own this resource")]
    NotOwner,
    #[error("cannot apply to own job")]
    OwnJob,
    #[error("cannot approve yourself")]
    SelfApproval,
}

/// Allows the caller when its role is one of `allowed`.
pub fn require_role(identity: &Identity, allowed: &[Role]) -> Result<(), Denied> {
    if allowed.contains(&identity.role) {
        Ok(())
    } else {
        Err(Denied::Role {
            actual: identity.role,
        })
    }
}

/// Allows ownership-scoped actions only for the resource owner.
pub fn require_owner(caller: Uuid, owner: Uuid) -> Result<(), Denied> {
    if caller == owner {
        Ok(())
    } else {
        Err(Denied::NotOwner)
    }
}

/// Allows the action only when `caller` and `other` are different principals,
/// reporting `denial` otherwise.
pub fn require_distinct(caller: Uuid, other: Uuid, denial: Denied) -> Result<(), Denied> {
    if caller == other {
        Err(denial)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(role: Role) -> Identity {
        Identity {
            id: Uuid::new_v4(),
            email: "someone@example.com".to_string(),
            role,
        }
    }

    #[test]
    fn role_check_matches_allowed_set() {
        let applicant = identity(Role::Applicant);
        assert!(require_role(&applicant, &[Role::Applicant]).is_ok());
        assert!(require_role(&applicant, &[Role::Applicant, Role::Client]).is_ok());
        assert_eq!(
            require_role(&applicant, &[Role::Client]),
            Err(Denied::Role {
                actual: Role::Applicant
            })
        );
    }

    #[test]
    fn ownership_requires_same_id() {
        let id = Uuid::new_v4();
        assert!(require_owner(id, id).is_ok());
        assert_eq!(require_owner(id, Uuid::new_v4()), Err(Denied::NotOwner));
    }

    #[test]
    fn distinct_reports_given_denial() {
        let id = Uuid::new_v4();
        assert_eq!(
            require_distinct(id, id, Denied::SelfApproval),
            Err(Denied::SelfApproval)
        );
        assert!(require_distinct(id, Uuid::new_v4(), Denied::OwnJob).is_ok());
    }
}
