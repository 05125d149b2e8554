//! The caller's agency, role and team, recomputed as a whole.

use uuid::Uuid;

use crate::client::{AgencyStore, Realtime, RealtimeMessage, Subscription};
use crate::crm::authz;
use crate::crm::feed::{ChangeEvent, ChangeFilter, Table};
use crate::crm::models::{
    Agency, AuthUser, Invitation, InvitationDetails, Member, Membership, PlanLimits, Role,
};
use crate::crm::validate;
use crate::errors::CrmError;

/// Everything the agency screens read. Empty when the caller has no agency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgencySnapshot {
    pub user: Option<AuthUser>,
    pub membership: Option<Membership>,
    pub agency: Option<Agency>,
    pub members: Vec<Member>,
}

pub struct AgencyContext<C> {
    client: C,
    snapshot: AgencySnapshot,
}

impl<C: AgencyStore> AgencyContext<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            snapshot: AgencySnapshot::default(),
        }
    }

    pub fn snapshot(&self) -> &AgencySnapshot {
        &self.snapshot
    }

    pub fn agency(&self) -> Option<&Agency> {
        self.snapshot.agency.as_ref()
    }

    pub fn role(&self) -> Option<Role> {
        self.snapshot.membership.map(|m| m.role)
    }

    pub fn members(&self) -> &[Member] {
        &self.snapshot.members
    }

    pub fn is_owner(&self) -> bool {
        self.role() == Some(Role::Owner)
    }

    /// Plan caps of the loaded agency.
    pub fn limits(&self) -> Option<PlanLimits> {
        self.agency().map(Agency::limits)
    }

    /// Rebuild the snapshot. On failure the previous one is kept.
    pub async fn refresh(&mut self) -> Result<&AgencySnapshot, CrmError> {
        match self.load().await {
            Ok(snapshot) => {
                self.snapshot = snapshot;
                Ok(&self.snapshot)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to refresh agency context");
                Err(e)
            }
        }
    }

    async fn load(&self) -> Result<AgencySnapshot, CrmError> {
        let user = self.client.current_user().await?;
        let Some(membership) = self.client.membership().await? else {
            return Ok(AgencySnapshot {
                user,
                ..Default::default()
            });
        };
        let agency = self.client.agency(membership.agency_id).await?;
        let members = self.client.list_members().await?;
        Ok(AgencySnapshot {
            user,
            membership: Some(membership),
            agency: Some(agency),
            members,
        })
    }

    /// Refresh on membership or agency changes. Returns whether it did.
    pub async fn refresh_on_change(&mut self, event: &ChangeEvent) -> Result<bool, CrmError> {
        if !matches!(event.table, Table::AgencyUsers | Table::Agencies) {
            return Ok(false);
        }
        self.refresh().await?;
        Ok(true)
    }

    /// Resynchronise when the subscription dropped changes.
    pub async fn handle_message(&mut self, message: &RealtimeMessage) -> Result<bool, CrmError> {
        match message {
            RealtimeMessage::Change(event) => self.refresh_on_change(event).await,
            RealtimeMessage::Resync { .. } => {
                self.refresh().await?;
                Ok(true)
            }
        }
    }

    /// The write already committed; a failed reload only leaves the
    /// snapshot stale until the next refresh.
    async fn refresh_after_write(&mut self) {
        if let Err(e) = self.refresh().await {
            tracing::warn!(error = %e, "write succeeded but the agency context could not be reloaded");
        }
    }

    fn membership(&self) -> Result<Membership, CrmError> {
        self.snapshot
            .membership
            .ok_or_else(|| CrmError::Forbidden("User does not belong to an agency".into()))
    }

    pub async fn add_member(&mut self, user_id: Uuid, role: Role) -> Result<Member, CrmError> {
        authz::can_add_member(self.membership()?.role, role)?;
        let member = self.client.add_member(user_id, role).await?;
        self.refresh_after_write().await;
        Ok(member)
    }

    /// Remove a teammate whose role is `role`.
    pub async fn remove_member(&mut self, member_id: Uuid, role: Role) -> Result<(), CrmError> {
        let own = self.membership()?;
        let actor = Member {
            id: own.member_id,
            agency_id: own.agency_id,
            user_id: Uuid::nil(),
            role: own.role,
            email: None,
        };
        let target = Member {
            id: member_id,
            role,
            ..actor.clone()
        };
        authz::can_remove_member(&actor, &target)?;
        self.client.remove_member(member_id).await?;
        self.refresh_after_write().await;
        Ok(())
    }

    pub async fn update_agency_name(&mut self, name: &str) -> Result<Agency, CrmError> {
        let name = validate::required("Agency name", name)?;
        authz::can_edit_agency(self.membership()?.role)?;
        let agency = self.client.update_agency_name(name).await?;
        self.refresh_after_write().await;
        Ok(agency)
    }

    /// Create an agency owned by the caller.
    pub async fn create_agency(&mut self, name: &str) -> Result<Agency, CrmError> {
        let name = validate::required("Agency name", name)?;
        if self.snapshot.membership.is_some() {
            return Err(CrmError::Conflict("User already belongs to an agency".into()));
        }
        let agency = self.client.create_agency(name).await?;
        self.refresh_after_write().await;
        Ok(agency)
    }

    /// Create an invitation, retrying once on a transient failure.
    pub async fn invite(&self, email: &str, role: Role) -> Result<Invitation, CrmError> {
        let email = validate::email(email)?;
        authz::can_invite(self.membership()?.role, role)?;
        match self.client.create_invitation(email.clone(), role).await {
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "invitation failed, retrying once");
                self.client.create_invitation(email, role).await
            }
            result => result,
        }
    }

    pub async fn invitation_details(&self, token: Uuid) -> Result<InvitationDetails, CrmError> {
        self.client.invitation_details(token).await
    }

    pub async fn accept_invitation(&mut self, token: Uuid) -> Result<Member, CrmError> {
        let member = self.client.accept_invitation(token).await?;
        self.refresh_after_write().await;
        Ok(member)
    }
}

impl<C: AgencyStore + Realtime> AgencyContext<C> {
    /// Subscribe to membership changes. Dropping the subscription stops it.
    pub async fn watch(&self) -> Result<Subscription, CrmError> {
        self.client
            .subscribe(ChangeFilter::table(Table::AgencyUsers))
            .await
    }
}
