//! Subscription checkout function.
//!
//! Resolves the caller's agency, ensures it has a payment customer and asks
//! the provider for a hosted checkout session. Only the agency owner may
//! subscribe.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crm::db::DbHandle;
use crate::crm::models::{AuthUser, Role};
use crate::crm::payments::{CustomerParams, PaymentProvider, SessionParams};
use crate::errors::CheckoutError;

/// Placeholder the provider replaces with the session id on redirect.
pub const SESSION_ID_PLACEHOLDER: &str = "{CHECKOUT_SESSION_ID}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub price_id: String,
    pub return_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub url: String,
}

pub fn success_url(return_url: &str) -> String {
    format!("{}?session_id={}", return_url, SESSION_ID_PLACEHOLDER)
}

#[derive(Clone)]
pub struct CheckoutService {
    db: DbHandle,
    provider: Arc<dyn PaymentProvider>,
}

impl CheckoutService {
    pub fn new(db: DbHandle, provider: Arc<dyn PaymentProvider>) -> Self {
        Self { db, provider }
    }

    pub async fn checkout(
        &self,
        user: Option<&AuthUser>,
        request: CheckoutRequest,
    ) -> Result<CheckoutResponse, CheckoutError> {
        let user = user.ok_or(CheckoutError::UserNotFound)?;
        if request.price_id.trim().is_empty() {
            return Err(CheckoutError::InvalidRequest("priceId is required".into()));
        }
        if request.return_url.trim().is_empty() {
            return Err(CheckoutError::InvalidRequest("returnUrl is required".into()));
        }

        let user_id = user.id;
        let member = self
            .db
            .call(move |db| db.membership_for_user(user_id))
            .await?
            .ok_or(CheckoutError::NoAgency)?;
        if member.role != Role::Owner {
            return Err(CheckoutError::NotOwner);
        }

        let agency_id = member.agency_id;
        let agency = self
            .db
            .call(move |db| db.get_agency(agency_id))
            .await?
            .ok_or(CheckoutError::NoAgency)?;

        let customer_id = match agency.payment_customer_id {
            Some(id) if !id.is_empty() => id,
            _ => {
                let id = self
                    .provider
                    .create_customer(&CustomerParams {
                        email: user.email.clone(),
                        agency_id: agency.id.to_string(),
                        user_id: user.id.to_string(),
                    })
                    .await?;
                let stored = id.clone();
                self.db
                    .call(move |db| db.set_payment_customer(agency_id, &stored))
                    .await?;
                tracing::info!(agency_id = %agency_id, "created payment customer");
                id
            }
        };

        let url = self
            .provider
            .create_checkout_session(&SessionParams {
                customer_id,
                price_id: request.price_id,
                success_url: success_url(&request.return_url),
                cancel_url: request.return_url,
            })
            .await?;
        tracing::info!(agency_id = %agency_id, "checkout session created");
        Ok(CheckoutResponse { url })
    }
}
