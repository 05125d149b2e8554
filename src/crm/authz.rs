//! Role checks applied before every mutating operation.

use super::models::{Member, Role};
use crate::errors::CrmError;

fn deny(reason: &str) -> CrmError {
    CrmError::Forbidden(reason.to_string())
}

/// Owners add managers and staff; managers add staff only.
pub fn can_add_member(actor: Role, new_role: Role) -> Result<(), CrmError> {
    match (actor, new_role) {
        (_, Role::Owner) => Err(deny("an agency has a single owner")),
        (Role::Owner, _) => Ok(()),
        (Role::Manager, Role::Staff) => Ok(()),
        (Role::Manager, _) => Err(deny("managers can only add staff")),
        (Role::Staff, _) => Err(deny("staff cannot manage members")),
    }
}

/// Managers may only remove staff. Owners may remove anyone but themselves.
pub fn can_remove_member(actor: &Member, target: &Member) -> Result<(), CrmError> {
    match actor.role {
        Role::Owner if actor.id == target.id => Err(deny("the owner cannot remove themselves")),
        Role::Owner => Ok(()),
        Role::Manager if target.role == Role::Staff => Ok(()),
        Role::Manager => Err(deny("managers can only remove staff")),
        Role::Staff => Err(deny("staff cannot manage members")),
    }
}

pub fn can_invite(actor: Role, invited_role: Role) -> Result<(), CrmError> {
    match actor {
        Role::Staff => Err(deny("staff cannot invite members")),
        _ => can_add_member(actor, invited_role),
    }
}

pub fn can_edit_agency(actor: Role) -> Result<(), CrmError> {
    match actor {
        Role::Owner => Ok(()),
        _ => Err(deny("only the owner can edit the agency")),
    }
}

pub fn can_manage_billing(actor: Role) -> Result<(), CrmError> {
    match actor {
        Role::Owner => Ok(()),
        _ => Err(deny("only the owner can manage billing")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn member(role: Role) -> Member {
        Member {
            id: Uuid::new_v4(),
            agency_id: Uuid::nil(),
            user_id: Uuid::new_v4(),
            role,
            email: None,
        }
    }

    #[test]
    fn test_add_member_matrix() {
        assert!(can_add_member(Role::Owner, Role::Manager).is_ok());
        assert!(can_add_member(Role::Owner, Role::Staff).is_ok());
        assert!(can_add_member(Role::Manager, Role::Staff).is_ok());
        assert!(can_add_member(Role::Manager, Role::Manager).is_err());
        assert!(can_add_member(Role::Staff, Role::Staff).is_err());
        assert!(can_add_member(Role::Owner, Role::Owner).is_err());
    }

    #[test]
    fn test_remove_member_rules() {
        let owner = member(Role::Owner);
        let manager = member(Role::Manager);
        let staff = member(Role::Staff);

        assert!(can_remove_member(&owner, &manager).is_ok());
        assert!(can_remove_member(&owner, &staff).is_ok());
        assert!(can_remove_member(&owner, &owner).is_err());
        assert!(can_remove_member(&manager, &staff).is_ok());
        assert!(can_remove_member(&manager, &owner).is_err());
        assert!(can_remove_member(&manager, &member(Role::Manager)).is_err());
        assert!(can_remove_member(&staff, &member(Role::Staff)).is_err());
    }

    #[test]
    fn test_owner_only_operations() {
        assert!(can_edit_agency(Role::Owner).is_ok());
        assert!(can_edit_agency(Role::Manager).is_err());
        assert!(can_manage_billing(Role::Owner).is_ok());
        match can_manage_billing(Role::Staff) {
            Err(CrmError::Forbidden(reason)) => assert!(reason.contains("owner")),
            other => panic!("Expected Forbidden, got {:?}", other),
        }
    }

    #[test]
    fn test_invite_rules() {
        assert!(can_invite(Role::Owner, Role::Manager).is_ok());
        assert!(can_invite(Role::Manager, Role::Staff).is_ok());
        assert!(can_invite(Role::Manager, Role::Manager).is_err());
        assert!(can_invite(Role::Staff, Role::Staff).is_err());
    }
}
