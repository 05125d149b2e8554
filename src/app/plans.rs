//! Plan limits and upgrade checkout, as seen from the agency context.

use crate::app::agency::AgencySnapshot;
use crate::checkout::{CheckoutRequest, CheckoutResponse};
use crate::client::Billing;
use crate::crm::models::{Agency, LimitedFeature, PlanLimits, PlanTier, Role};
use crate::errors::CheckoutError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanGuard {
    agency: Option<Agency>,
    role: Option<Role>,
}

impl PlanGuard {
    pub fn new(agency: Option<Agency>, role: Option<Role>) -> Self {
        Self { agency, role }
    }

    pub fn from_snapshot(snapshot: &AgencySnapshot) -> Self {
        Self::new(snapshot.agency.clone(), snapshot.membership.map(|m| m.role))
    }

    pub fn tier(&self) -> Option<PlanTier> {
        self.agency.as_ref().map(|a| a.subscription_tier)
    }

    pub fn limits(&self) -> Option<PlanLimits> {
        self.agency.as_ref().map(Agency::limits)
    }

    /// Whether another `feature` item is blocked. Everything is blocked
    /// until an agency is loaded.
    pub fn is_at_limit(&self, feature: LimitedFeature, count: u64) -> bool {
        match self.limits() {
            Some(limits) => limits.is_at_limit(feature, count),
            None => true,
        }
    }

    /// Items still allowed; `None` when unlimited.
    pub fn remaining(&self, feature: LimitedFeature, count: u64) -> Option<u64> {
        match self.limits() {
            Some(limits) => limits.limit(feature).map(|max| max.saturating_sub(count)),
            None => Some(0),
        }
    }

    pub fn shows_watermark(&self) -> bool {
        self.limits().is_none_or(|l| l.watermark)
    }

    /// Start a subscription checkout. Only the owner gets as far as the call.
    pub async fn start_checkout<B: Billing>(
        &self,
        billing: &B,
        price_id: &str,
        return_url: &str,
    ) -> Result<CheckoutResponse, CheckoutError> {
        match self.role {
            None => return Err(CheckoutError::NoAgency),
            Some(Role::Owner) => {}
            Some(_) => return Err(CheckoutError::NotOwner),
        }
        let response = billing
            .start_checkout(CheckoutRequest {
                price_id: price_id.to_string(),
                return_url: return_url.to_string(),
            })
            .await;
        if let Err(e) = &response {
            tracing::warn!(error = %e, "checkout failed");
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::agency::AgencyContext;
    use crate::client::local::tests::{add_user, seeded};
    use crate::client::AgencyStore;

    #[test]
    fn test_no_agency_blocks_everything() {
        let guard = PlanGuard::default();
        assert!(guard.is_at_limit(LimitedFeature::Quizzes, 0));
        assert_eq!(guard.remaining(LimitedFeature::Clients, 0), Some(0));
        assert!(guard.shows_watermark());
    }

    #[tokio::test]
    async fn test_free_and_pro_limits() {
        let (_, owner, _) = seeded();
        let mut ctx = AgencyContext::new(owner.clone());
        let guard = PlanGuard::from_snapshot(ctx.refresh().await.unwrap());
        assert_eq!(guard.tier(), Some(PlanTier::Free));
        assert!(!guard.is_at_limit(LimitedFeature::Quizzes, 0));
        assert!(guard.is_at_limit(LimitedFeature::Quizzes, 1));
        assert_eq!(guard.remaining(LimitedFeature::Clients, 3), Some(2));

        let agency_id = guard.agency.as_ref().unwrap().id;
        owner
            .db()
            .lock_sync()
            .unwrap()
            .set_subscription(agency_id, PlanTier::Pro, "active")
            .unwrap();
        let guard = PlanGuard::from_snapshot(ctx.refresh().await.unwrap());
        assert!(!guard.is_at_limit(LimitedFeature::Quizzes, 1000));
        assert_eq!(guard.remaining(LimitedFeature::Contracts, 1000), None);
        assert!(guard.is_at_limit(LimitedFeature::Users, 10));
        assert!(!guard.shows_watermark());
    }

    #[tokio::test]
    async fn test_checkout_requires_owner_before_calling() {
        let (_, owner, _) = seeded();
        let staff = add_user(&owner, "staff@acme.test");
        owner.add_member(staff.id, Role::Staff).await.unwrap();
        let staff_client = owner.as_user(staff);

        let mut ctx = AgencyContext::new(staff_client.clone());
        let guard = PlanGuard::from_snapshot(ctx.refresh().await.unwrap());
        // the client has no checkout configured, so reaching it would be NotConfigured
        assert!(matches!(
            guard.start_checkout(&staff_client, "price_1", "https://app.test/plans").await,
            Err(CheckoutError::NotOwner)
        ));
        assert!(matches!(
            PlanGuard::default()
                .start_checkout(&staff_client, "price_1", "https://app.test/plans")
                .await,
            Err(CheckoutError::NoAgency)
        ));

        let mut ctx = AgencyContext::new(owner.clone());
        let guard = PlanGuard::from_snapshot(ctx.refresh().await.unwrap());
        assert!(matches!(
            guard.start_checkout(&owner, "price_1", "https://app.test/plans").await,
            Err(CheckoutError::NotConfigured)
        ));
    }
}
