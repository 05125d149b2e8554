//! In-process persistence client.
//!
//! Runs every call against the SQLite store on the blocking pool, applies
//! tenant scoping and role checks for the caller, and announces each write
//! on the change feed. The HTTP service uses it for every request.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::{
    AgencyStore, Billing, ContactStore, ContractStore, DealStore, NotificationStore, ProfileStore,
    QuizStore, Realtime, RealtimeMessage, SUBSCRIPTION_BUFFER, Subscription,
};
use crate::checkout::{CheckoutRequest, CheckoutResponse, CheckoutService};
use crate::crm::authz;
use crate::crm::db::DbHandle;
use crate::crm::feed::{ChangeEvent, ChangeFeed, ChangeFilter, ChangeKind, Scope, Table};
use crate::crm::models::*;
use crate::crm::validate;
use crate::errors::{CheckoutError, CrmError};

#[derive(Clone)]
pub struct LocalClient {
    db: DbHandle,
    feed: ChangeFeed,
    caller: Option<AuthUser>,
    checkout: Option<CheckoutService>,
}

impl LocalClient {
    /// An anonymous client. Only the public quiz operations succeed.
    pub fn new(db: DbHandle, feed: ChangeFeed) -> Self {
        Self {
            db,
            feed,
            caller: None,
            checkout: None,
        }
    }

    /// The same backend acting for `user`.
    pub fn as_user(&self, user: AuthUser) -> Self {
        Self {
            caller: Some(user),
            ..self.clone()
        }
    }

    pub fn with_checkout(mut self, checkout: CheckoutService) -> Self {
        self.checkout = Some(checkout);
        self
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    fn user(&self) -> Result<&AuthUser, CrmError> {
        self.caller.as_ref().ok_or(CrmError::Unauthorized)
    }

    /// The caller's membership, required for every tenant-scoped operation.
    async fn member(&self) -> Result<Member, CrmError> {
        let user_id = self.user()?.id;
        self.db
            .call(move |db| db.membership_for_user(user_id))
            .await?
            .ok_or_else(|| CrmError::Forbidden("User does not belong to an agency".into()))
    }

    /// Reject the write when the agency has used up its plan allowance.
    async fn check_limit(&self, agency_id: Uuid, feature: LimitedFeature) -> Result<(), CrmError> {
        let (agency, count) = self
            .db
            .call(move |db| {
                let agency = db
                    .get_agency(agency_id)?
                    .ok_or_else(|| CrmError::not_found("Agency", agency_id))?;
                let count = match feature {
                    LimitedFeature::Quizzes => db.count_quizzes(agency_id)?,
                    LimitedFeature::Clients => db.count_contacts(agency_id)?,
                    LimitedFeature::Contracts => db.count_contracts(agency_id)?,
                    LimitedFeature::Users => db.list_members(agency_id)?.len() as i64,
                };
                Ok((agency, count))
            })
            .await?;
        let limits = agency.limits();
        if limits.is_at_limit(feature, count.max(0) as u64) {
            return Err(CrmError::Forbidden(format!(
                "the {} plan allows at most {} {}",
                agency.subscription_tier.as_str(),
                limits.limit(feature).unwrap_or_default(),
                feature.as_str()
            )));
        }
        Ok(())
    }

    fn publish<T: serde::Serialize>(&self, table: Table, kind: ChangeKind, agency_id: Uuid, record: &T) {
        self.feed
            .publish(ChangeEvent::new(table, kind, Some(agency_id), record));
    }

    /// Resolve the agency that owns a quiz and make sure it is the caller's.
    async fn owned_quiz(&self, quiz_id: Uuid) -> Result<(Member, Quiz), CrmError> {
        let member = self.member().await?;
        let quiz = self
            .db
            .call(move |db| db.get_quiz(quiz_id))
            .await?
            .filter(|q| q.agency_id == member.agency_id)
            .ok_or_else(|| CrmError::not_found("Quiz", quiz_id))?;
        Ok((member, quiz))
    }

    async fn owned_question(&self, question_id: Uuid) -> Result<Member, CrmError> {
        let member = self.member().await?;
        let agency = self
            .db
            .call(move |db| db.question_agency(question_id))
            .await?;
        if agency != Some(member.agency_id) {
            return Err(CrmError::not_found("Question", question_id));
        }
        Ok(member)
    }

    async fn owned_option(&self, option_id: Uuid) -> Result<Member, CrmError> {
        let member = self.member().await?;
        let agency = self.db.call(move |db| db.option_agency(option_id)).await?;
        if agency != Some(member.agency_id) {
            return Err(CrmError::not_found("Option", option_id));
        }
        Ok(member)
    }
}

fn validate_deal(deal: NewDeal) -> Result<NewDeal, CrmError> {
    Ok(NewDeal {
        title: validate::required("Title", &deal.title)?,
        value: validate::non_negative("Value", deal.value)?,
        ..deal
    })
}

fn validate_contract(contract: ContractInput) -> Result<ContractInput, CrmError> {
    Ok(ContractInput {
        title: validate::required("Title", &contract.title)?,
        mrr: validate::non_negative("MRR", contract.mrr)?,
        ..contract
    })
}

// ── Deals ─────────────────────────────────────────────────────────────

#[async_trait]
impl DealStore for LocalClient {
    async fn list_deals(&self) -> Result<Vec<DealWithContact>, CrmError> {
        let agency_id = self.member().await?.agency_id;
        self.db.call(move |db| db.list_deals(agency_id)).await
    }

    async fn create_deal(&self, deal: NewDeal) -> Result<Deal, CrmError> {
        let deal = validate_deal(deal)?;
        let agency_id = self.member().await?.agency_id;
        let created = self
            .db
            .call(move |db| {
                if let Some(contact_id) = deal.contact_id {
                    db.get_contact(contact_id)?
                        .filter(|c| c.agency_id == agency_id)
                        .ok_or_else(|| CrmError::not_found("Contact", contact_id))?;
                }
                db.create_deal(agency_id, &deal)
            })
            .await?;
        self.publish(Table::Deals, ChangeKind::Insert, agency_id, &created);
        Ok(created)
    }

    async fn update_deal_stage(&self, id: Uuid, stage: Stage) -> Result<Deal, CrmError> {
        let agency_id = self.member().await?.agency_id;
        let deal = self
            .db
            .call(move |db| db.update_deal_stage(agency_id, id, stage))
            .await?
            .ok_or_else(|| CrmError::not_found("Deal", id))?;
        tracing::debug!(deal_id = %id, stage = %stage, "deal stage updated");
        self.publish(Table::Deals, ChangeKind::Update, agency_id, &deal);
        Ok(deal)
    }

    async fn delete_deal(&self, id: Uuid) -> Result<(), CrmError> {
        let agency_id = self.member().await?.agency_id;
        let deleted = self
            .db
            .call(move |db| db.delete_deal(agency_id, id))
            .await?;
        if !deleted {
            return Err(CrmError::not_found("Deal", id));
        }
        self.publish(Table::Deals, ChangeKind::Delete, agency_id, &serde_json::json!({ "id": id }));
        Ok(())
    }
}

// ── Contacts ──────────────────────────────────────────────────────────

#[async_trait]
impl ContactStore for LocalClient {
    async fn list_contacts(&self) -> Result<Vec<Contact>, CrmError> {
        let agency_id = self.member().await?.agency_id;
        self.db.call(move |db| db.list_contacts(agency_id)).await
    }

    async fn create_contact(&self, contact: NewContact) -> Result<Contact, CrmError> {
        let name = validate::required("Name", &contact.name)?;
        if contact.score < 0 {
            return Err(CrmError::Validation("Score must be zero or more".into()));
        }
        let email = validate::optional(contact.email);
        if let Some(email) = &email {
            validate::email(email)?;
        }
        let contact = NewContact {
            name,
            email,
            phone: validate::optional(contact.phone),
            ..contact
        };

        let agency_id = self.member().await?.agency_id;
        self.check_limit(agency_id, LimitedFeature::Clients).await?;
        let created = self
            .db
            .call(move |db| db.create_contact(agency_id, &contact))
            .await?;
        self.publish(Table::Contacts, ChangeKind::Insert, agency_id, &created);
        Ok(created)
    }

    async fn delete_contact(&self, id: Uuid) -> Result<(), CrmError> {
        let agency_id = self.member().await?.agency_id;
        let deleted = self
            .db
            .call(move |db| db.delete_contact(agency_id, id))
            .await?;
        if !deleted {
            return Err(CrmError::not_found("Contact", id));
        }
        self.publish(Table::Contacts, ChangeKind::Delete, agency_id, &serde_json::json!({ "id": id }));
        Ok(())
    }
}

// ── Contracts ─────────────────────────────────────────────────────────

#[async_trait]
impl ContractStore for LocalClient {
    async fn list_contracts(&self) -> Result<Vec<ContractWithContact>, CrmError> {
        let agency_id = self.member().await?.agency_id;
        self.db.call(move |db| db.list_contracts(agency_id)).await
    }

    async fn create_contract(&self, contract: ContractInput) -> Result<Contract, CrmError> {
        let contract = validate_contract(contract)?;
        let agency_id = self.member().await?.agency_id;
        self.check_limit(agency_id, LimitedFeature::Contracts).await?;
        let created = self
            .db
            .call(move |db| db.create_contract(agency_id, &contract))
            .await?;
        self.publish(Table::Contracts, ChangeKind::Insert, agency_id, &created);
        Ok(created)
    }

    async fn update_contract(&self, id: Uuid, contract: ContractInput) -> Result<Contract, CrmError> {
        let contract = validate_contract(contract)?;
        let agency_id = self.member().await?.agency_id;
        let updated = self
            .db
            .call(move |db| db.update_contract(agency_id, id, &contract))
            .await?
            .ok_or_else(|| CrmError::not_found("Contract", id))?;
        self.publish(Table::Contracts, ChangeKind::Update, agency_id, &updated);
        Ok(updated)
    }

    async fn delete_contract(&self, id: Uuid) -> Result<(), CrmError> {
        let agency_id = self.member().await?.agency_id;
        let deleted = self
            .db
            .call(move |db| db.delete_contract(agency_id, id))
            .await?;
        if !deleted {
            return Err(CrmError::not_found("Contract", id));
        }
        self.publish(Table::Contracts, ChangeKind::Delete, agency_id, &serde_json::json!({ "id": id }));
        Ok(())
    }
}

// ── Quizzes ───────────────────────────────────────────────────────────

#[async_trait]
impl QuizStore for LocalClient {
    async fn list_quizzes(&self) -> Result<Vec<QuizSummary>, CrmError> {
        let agency_id = self.member().await?.agency_id;
        self.db.call(move |db| db.list_quizzes(agency_id)).await
    }

    async fn create_quiz(&self, title: String, description: String) -> Result<Quiz, CrmError> {
        let title = validate::required("Title", &title)?;
        let member = self.member().await?;
        self.check_limit(member.agency_id, LimitedFeature::Quizzes)
            .await?;
        let quiz = self
            .db
            .call(move |db| db.create_quiz(member.agency_id, member.user_id, &title, description.trim()))
            .await?;
        self.publish(Table::Quizzes, ChangeKind::Insert, quiz.agency_id, &quiz);
        Ok(quiz)
    }

    async fn quiz_detail(&self, id: Uuid) -> Result<QuizDetail, CrmError> {
        let (_, quiz) = self.owned_quiz(id).await?;
        let questions = self.db.call(move |db| db.list_questions(id)).await?;
        Ok(QuizDetail { quiz, questions })
    }

    async fn update_quiz(&self, id: Uuid, update: QuizUpdate) -> Result<Quiz, CrmError> {
        let update = QuizUpdate {
            title: update
                .title
                .map(|t| validate::required("Title", &t))
                .transpose()?,
            ..update
        };
        let (member, _) = self.owned_quiz(id).await?;
        let quiz = self
            .db
            .call(move |db| db.update_quiz(id, &update))
            .await?
            .ok_or_else(|| CrmError::not_found("Quiz", id))?;
        self.publish(Table::Quizzes, ChangeKind::Update, member.agency_id, &quiz);
        Ok(quiz)
    }

    async fn delete_quiz(&self, id: Uuid) -> Result<(), CrmError> {
        let (member, _) = self.owned_quiz(id).await?;
        self.db.call(move |db| db.delete_quiz(id)).await?;
        self.publish(Table::Quizzes, ChangeKind::Delete, member.agency_id, &serde_json::json!({ "id": id }));
        Ok(())
    }

    async fn add_question(&self, quiz_id: Uuid, question: NewQuestion) -> Result<Question, CrmError> {
        let question = NewQuestion {
            text: validate::required("Question", &question.text)?,
            ..question
        };
        self.owned_quiz(quiz_id).await?;
        self.db
            .call(move |db| db.add_question(quiz_id, &question))
            .await
    }

    async fn update_question(&self, id: Uuid, update: QuestionUpdate) -> Result<Question, CrmError> {
        let update = QuestionUpdate {
            text: update
                .text
                .map(|t| validate::required("Question", &t))
                .transpose()?,
            ..update
        };
        self.owned_question(id).await?;
        self.db
            .call(move |db| db.update_question(id, &update))
            .await?
            .ok_or_else(|| CrmError::not_found("Question", id))
    }

    async fn delete_question(&self, id: Uuid) -> Result<(), CrmError> {
        self.owned_question(id).await?;
        self.db.call(move |db| db.delete_question(id)).await?;
        Ok(())
    }

    async fn reorder_questions(&self, quiz_id: Uuid, order: Vec<Uuid>) -> Result<Vec<Question>, CrmError> {
        self.owned_quiz(quiz_id).await?;
        self.db
            .call(move |db| db.reorder_questions(quiz_id, &order))
            .await
    }

    async fn add_option(&self, question_id: Uuid, option: NewOption) -> Result<QuizOption, CrmError> {
        let option = NewOption {
            text: validate::required("Option", &option.text)?,
            ..option
        };
        self.owned_question(question_id).await?;
        self.db
            .call(move |db| db.add_option(question_id, &option))
            .await
    }

    async fn update_option(&self, id: Uuid, update: OptionUpdate) -> Result<QuizOption, CrmError> {
        let update = OptionUpdate {
            text: update
                .text
                .map(|t| validate::required("Option", &t))
                .transpose()?,
            ..update
        };
        self.owned_option(id).await?;
        self.db
            .call(move |db| db.update_option(id, &update))
            .await?
            .ok_or_else(|| CrmError::not_found("Option", id))
    }

    async fn delete_option(&self, id: Uuid) -> Result<(), CrmError> {
        self.owned_option(id).await?;
        self.db.call(move |db| db.delete_option(id)).await?;
        Ok(())
    }

    async fn list_responses(&self, quiz_id: Uuid) -> Result<Vec<QuizResponse>, CrmError> {
        self.owned_quiz(quiz_id).await?;
        self.db.call(move |db| db.list_responses(quiz_id)).await
    }

    async fn published_quiz(&self, id: Uuid) -> Result<PublicQuiz, CrmError> {
        self.db
            .call(move |db| db.published_quiz(id))
            .await?
            .ok_or_else(|| CrmError::not_found("Quiz", id))
    }

    async fn submit_response(&self, submission: QuizSubmission) -> Result<SubmissionReceipt, CrmError> {
        let respondent = &submission.respondent;
        validate::required("Name", &respondent.name)?;
        validate::required("Email", &respondent.email)?;
        validate::required("WhatsApp", &respondent.whatsapp)?;

        let records = self
            .db
            .call(move |db| db.submit_response(&submission))
            .await?;
        let agency_id = records.contact.agency_id;
        self.publish(Table::Contacts, ChangeKind::Insert, agency_id, &records.contact);
        self.publish(Table::Deals, ChangeKind::Insert, agency_id, &records.deal);
        self.publish(Table::QuizResponses, ChangeKind::Insert, agency_id, &records.response);
        self.publish(Table::Notifications, ChangeKind::Insert, agency_id, &records.notification);
        tracing::info!(
            quiz_id = %records.response.quiz_id,
            contact_id = %records.contact.id,
            score = records.response.total_score,
            "quiz response recorded"
        );
        Ok(records.receipt())
    }
}

// ── Agencies ──────────────────────────────────────────────────────────

#[async_trait]
impl AgencyStore for LocalClient {
    async fn current_user(&self) -> Result<Option<AuthUser>, CrmError> {
        Ok(self.caller.clone())
    }

    async fn membership(&self) -> Result<Option<Membership>, CrmError> {
        let Some(user) = &self.caller else {
            return Ok(None);
        };
        let user_id = user.id;
        let member = self
            .db
            .call(move |db| db.membership_for_user(user_id))
            .await?;
        Ok(member.as_ref().map(Membership::from))
    }

    async fn agency(&self, id: Uuid) -> Result<Agency, CrmError> {
        let member = self.member().await?;
        if member.agency_id != id {
            return Err(CrmError::not_found("Agency", id));
        }
        self.db
            .call(move |db| db.get_agency(id))
            .await?
            .ok_or_else(|| CrmError::not_found("Agency", id))
    }

    async fn list_members(&self) -> Result<Vec<Member>, CrmError> {
        let agency_id = self.member().await?.agency_id;
        self.db.call(move |db| db.list_members(agency_id)).await
    }

    async fn create_agency(&self, name: String) -> Result<Agency, CrmError> {
        let name = validate::required("Agency name", &name)?;
        let user_id = self.user()?.id;
        let (agency, owner) = self
            .db
            .call(move |db| db.create_agency(&name, user_id))
            .await?;
        tracing::info!(agency_id = %agency.id, "agency created");
        self.publish(Table::Agencies, ChangeKind::Insert, agency.id, &agency);
        self.publish(Table::AgencyUsers, ChangeKind::Insert, agency.id, &owner);
        Ok(agency)
    }

    async fn update_agency_name(&self, name: String) -> Result<Agency, CrmError> {
        let name = validate::required("Agency name", &name)?;
        let member = self.member().await?;
        authz::can_edit_agency(member.role)?;
        let agency_id = member.agency_id;
        let agency = self
            .db
            .call(move |db| db.update_agency_name(agency_id, &name))
            .await?
            .ok_or_else(|| CrmError::not_found("Agency", agency_id))?;
        self.publish(Table::Agencies, ChangeKind::Update, agency_id, &agency);
        Ok(agency)
    }

    async fn add_member(&self, user_id: Uuid, role: Role) -> Result<Member, CrmError> {
        let actor = self.member().await?;
        authz::can_add_member(actor.role, role)?;
        self.check_limit(actor.agency_id, LimitedFeature::Users)
            .await?;
        let agency_id = actor.agency_id;
        let member = self
            .db
            .call(move |db| {
                db.get_auth_user(user_id)?
                    .ok_or_else(|| CrmError::not_found("User", user_id))?;
                db.add_member(agency_id, user_id, role)
            })
            .await?;
        self.publish(Table::AgencyUsers, ChangeKind::Insert, agency_id, &member);
        Ok(member)
    }

    async fn remove_member(&self, member_id: Uuid) -> Result<(), CrmError> {
        let actor = self.member().await?;
        let target = self
            .db
            .call(move |db| db.get_member(member_id))
            .await?
            .filter(|m| m.agency_id == actor.agency_id)
            .ok_or_else(|| CrmError::not_found("Member", member_id))?;
        authz::can_remove_member(&actor, &target)?;
        let agency_id = actor.agency_id;
        self.db
            .call(move |db| db.remove_member(agency_id, member_id))
            .await?;
        self.publish(Table::AgencyUsers, ChangeKind::Delete, agency_id, &target);
        Ok(())
    }

    async fn create_invitation(&self, email: String, role: Role) -> Result<Invitation, CrmError> {
        let email = validate::email(&email)?.to_lowercase();
        let actor = self.member().await?;
        authz::can_invite(actor.role, role)?;
        let (agency_id, user_id) = (actor.agency_id, actor.user_id);
        let invitation = self
            .db
            .call(move |db| db.create_invitation(agency_id, &email, role, user_id))
            .await?;
        tracing::info!(agency_id = %agency_id, role = %role, "invitation created");
        Ok(invitation)
    }

    async fn invitation_details(&self, token: Uuid) -> Result<InvitationDetails, CrmError> {
        self.db
            .call(move |db| db.invitation_details(token))
            .await?
            .ok_or_else(|| CrmError::not_found("Invitation", token))
    }

    async fn accept_invitation(&self, token: Uuid) -> Result<Member, CrmError> {
        let user = self.user()?.clone();
        let member = self
            .db
            .call(move |db| db.accept_invitation(token, &user))
            .await?;
        self.publish(Table::AgencyUsers, ChangeKind::Insert, member.agency_id, &member);
        Ok(member)
    }
}

// ── Notifications ─────────────────────────────────────────────────────

#[async_trait]
impl NotificationStore for LocalClient {
    async fn list_notifications(&self, limit: usize) -> Result<Vec<Notification>, CrmError> {
        let agency_id = self.member().await?.agency_id;
        self.db
            .call(move |db| db.list_notifications(agency_id, limit))
            .await
    }

    async fn mark_read(&self, ids: Vec<Uuid>) -> Result<(), CrmError> {
        if ids.is_empty() {
            return Ok(());
        }
        let agency_id = self.member().await?.agency_id;
        let payload = serde_json::json!({ "ids": ids, "read": true });
        self.db
            .call(move |db| db.mark_notifications_read(agency_id, &ids))
            .await?;
        self.publish(Table::Notifications, ChangeKind::Update, agency_id, &payload);
        Ok(())
    }

    async fn mark_all_read(&self) -> Result<(), CrmError> {
        let agency_id = self.member().await?.agency_id;
        let updated = self
            .db
            .call(move |db| db.mark_all_notifications_read(agency_id))
            .await?;
        if updated > 0 {
            self.publish(
                Table::Notifications,
                ChangeKind::Update,
                agency_id,
                &serde_json::json!({ "all": true, "read": true }),
            );
        }
        Ok(())
    }
}

// ── Profiles ──────────────────────────────────────────────────────────

#[async_trait]
impl ProfileStore for LocalClient {
    async fn get_profile(&self) -> Result<Option<Profile>, CrmError> {
        let user_id = self.user()?.id;
        self.db.call(move |db| db.get_profile(user_id)).await
    }

    async fn update_theme(&self, mode: ThemeMode, style: ThemeStyle) -> Result<bool, CrmError> {
        let user_id = self.user()?.id;
        let updated = self
            .db
            .call(move |db| db.update_profile_theme(user_id, mode, style))
            .await?;
        if updated {
            self.feed.publish(
                ChangeEvent::new(
                    Table::Profiles,
                    ChangeKind::Update,
                    None,
                    &serde_json::json!({ "id": user_id, "theme_mode": mode, "theme_style": style }),
                )
                .for_user(user_id),
            );
        }
        Ok(updated)
    }

    async fn upsert_profile(&self, profile: Profile) -> Result<Profile, CrmError> {
        let user_id = self.user()?.id;
        let profile = Profile {
            id: user_id,
            avatar_url: validate::optional(profile.avatar_url),
            ..profile
        };
        let saved = self
            .db
            .call(move |db| db.upsert_profile(&profile))
            .await?;
        self.feed.publish(
            ChangeEvent::new(Table::Profiles, ChangeKind::Update, None, &saved).for_user(user_id),
        );
        Ok(saved)
    }
}

// ── Realtime ──────────────────────────────────────────────────────────

#[async_trait]
impl Realtime for LocalClient {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription, CrmError> {
        let user_id = self.user()?.id;
        let agency_id = member_agency(&self.db, user_id).await?;
        let scope = Scope {
            agency_id,
            user_id: Some(user_id),
        };
        Ok(pump(self.feed.subscribe(), filter, scope, self.db.clone()))
    }
}

async fn member_agency(db: &DbHandle, user_id: Uuid) -> Result<Option<Uuid>, CrmError> {
    Ok(db
        .call(move |db| db.membership_for_user(user_id))
        .await?
        .map(|m| m.agency_id))
}

/// Forward matching feed events into a subscription until it is dropped.
///
/// Membership is looked up again on every `agency_users` change and before
/// each agency row is delivered. A caller who joins an agency starts
/// receiving its rows; a caller who leaves (or whose lookup fails) has the
/// subscription closed.
fn pump(
    mut rx: broadcast::Receiver<ChangeEvent>,
    filter: ChangeFilter,
    mut scope: Scope,
    db: DbHandle,
) -> Subscription {
    let (tx, out) = mpsc::channel(SUBSCRIPTION_BUFFER);
    let task = tokio::spawn(async move {
        loop {
            let message = match rx.recv().await {
                Ok(event) => {
                    let agency_row = event.agency_id.is_some() && event.agency_id == scope.agency_id;
                    let recheck = event.table == Table::AgencyUsers
                        || (agency_row && filter.matches(&event));
                    if recheck && !rescope(&mut scope, &db).await {
                        break;
                    }
                    if !(filter.matches(&event) && scope.allows(&event)) {
                        continue;
                    }
                    RealtimeMessage::Change(event)
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, table = %filter.table, "realtime subscriber lagged");
                    RealtimeMessage::Resync { skipped }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if tx.send(message).await.is_err() {
                break;
            }
        }
    });
    Subscription::new(out, task)
}

/// Refresh the agency half of `scope`. Returns false when the caller lost
/// the agency the subscription was opened under.
async fn rescope(scope: &mut Scope, db: &DbHandle) -> bool {
    let Some(user_id) = scope.user_id else {
        return false;
    };
    match member_agency(db, user_id).await {
        Ok(current) if scope.agency_id.is_some() && current != scope.agency_id => {
            tracing::info!(user_id = %user_id, "membership changed, closing realtime subscription");
            false
        }
        Ok(current) => {
            scope.agency_id = current;
            true
        }
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "membership lookup failed, closing realtime subscription");
            false
        }
    }
}

// ── Billing ───────────────────────────────────────────────────────────

#[async_trait]
impl Billing for LocalClient {
    async fn start_checkout(&self, request: CheckoutRequest) -> Result<CheckoutResponse, CheckoutError> {
        let service = self.checkout.as_ref().ok_or(CheckoutError::NotConfigured)?;
        service.checkout(self.caller.as_ref(), request).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crm::db::CrmDb;

    /// A backend with one agency: returns the anonymous client, the owner's
    /// client and the owner.
    pub(crate) fn seeded() -> (LocalClient, LocalClient, AuthUser) {
        let db = DbHandle::new(CrmDb::new_in_memory().unwrap());
        let owner = {
            let guard = db.lock_sync().unwrap();
            let owner = guard.create_auth_user("owner@acme.test", "h-owner").unwrap();
            guard.create_agency("Acme", owner.id).unwrap();
            owner
        };
        let anon = LocalClient::new(db, ChangeFeed::new());
        let client = anon.as_user(owner.clone());
        (anon, client, owner)
    }

    pub(crate) fn add_user(client: &LocalClient, email: &str) -> AuthUser {
        client
            .db()
            .lock_sync()
            .unwrap()
            .create_auth_user(email, &format!("h-{}", email))
            .unwrap()
    }

    #[tokio::test]
    async fn test_anonymous_client_is_unauthorized_for_tenant_data() {
        let (anon, _, _) = seeded();
        assert!(matches!(anon.list_deals().await, Err(CrmError::Unauthorized)));
        assert!(anon.membership().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_user_without_agency_is_forbidden() {
        let (_, client, _) = seeded();
        let loner = add_user(&client, "loner@x.test");
        let loner_client = client.as_user(loner);
        match loner_client.list_deals().await {
            Err(CrmError::Forbidden(msg)) => assert_eq!(msg, "User does not belong to an agency"),
            other => panic!("Expected Forbidden, got {:?}", other),
        }
        assert!(loner_client.membership().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_deal_validates_before_storage() {
        let (_, client, _) = seeded();
        let err = client
            .create_deal(NewDeal {
                title: "  ".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::Validation(_)));
        let err = client
            .create_deal(NewDeal {
                title: "X".into(),
                value: -5.0,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::Validation(_)));
        assert!(client.list_deals().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deal_writes_publish_changes() {
        let (_, client, _) = seeded();
        let mut rx = client.feed().subscribe();
        let deal = client
            .create_deal(NewDeal {
                title: "Website".into(),
                value: 1200.0,
                ..Default::default()
            })
            .await
            .unwrap();
        let moved = client.update_deal_stage(deal.id, Stage::Qualified).await.unwrap();
        assert_eq!(moved.stage, Stage::Qualified);
        client.delete_deal(deal.id).await.unwrap();

        let kinds: Vec<_> = (0..3).map(|_| rx.try_recv().unwrap().kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]);

        assert!(matches!(
            client.delete_deal(deal.id).await,
            Err(CrmError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_free_plan_blocks_second_quiz() {
        let (_, client, _) = seeded();
        client.create_quiz("First".into(), String::new()).await.unwrap();
        match client.create_quiz("Second".into(), String::new()).await {
            Err(CrmError::Forbidden(msg)) => assert!(msg.contains("at most 1 quizzes")),
            other => panic!("Expected plan limit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_agency_cannot_see_quiz() {
        let (_, client, _) = seeded();
        let quiz = client.create_quiz("Mine".into(), String::new()).await.unwrap();

        let rival = add_user(&client, "rival@other.test");
        let rival_client = client.as_user(rival);
        rival_client.create_agency("Other".into()).await.unwrap();
        assert!(matches!(
            rival_client.quiz_detail(quiz.id).await,
            Err(CrmError::NotFound(_))
        ));
        assert!(matches!(
            rival_client.delete_quiz(quiz.id).await,
            Err(CrmError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_member_management_roles() {
        let (_, owner_client, _) = seeded();
        let manager = add_user(&owner_client, "manager@acme.test");
        let staff = add_user(&owner_client, "staff@acme.test");

        let manager_member = owner_client.add_member(manager.id, Role::Manager).await.unwrap();
        // free plan: owner + manager fill both seats
        assert!(matches!(
            owner_client.add_member(staff.id, Role::Staff).await,
            Err(CrmError::Forbidden(_))
        ));
        let err = owner_client.add_member(manager.id, Role::Manager).await.unwrap_err();
        assert!(matches!(err, CrmError::Forbidden(_) | CrmError::Conflict(_)));

        let manager_client = owner_client.as_user(manager);
        let owner_member = owner_client
            .list_members()
            .await
            .unwrap()
            .into_iter()
            .find(|m| m.role == Role::Owner)
            .unwrap();
        assert!(matches!(
            manager_client.remove_member(owner_member.id).await,
            Err(CrmError::Forbidden(_))
        ));
        assert!(matches!(
            owner_client.remove_member(owner_member.id).await,
            Err(CrmError::Forbidden(_))
        ));
        owner_client.remove_member(manager_member.id).await.unwrap();
        assert_eq!(owner_client.list_members().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_add_existing_member_is_conflict_on_pro() {
        let (_, owner_client, _) = seeded();
        let agency_id = owner_client.membership().await.unwrap().unwrap().agency_id;
        owner_client
            .db()
            .call(move |db| db.set_subscription(agency_id, PlanTier::Pro, "active"))
            .await
            .unwrap();
        let staff = add_user(&owner_client, "staff@acme.test");
        owner_client.add_member(staff.id, Role::Staff).await.unwrap();
        match owner_client.add_member(staff.id, Role::Staff).await {
            Err(CrmError::Conflict(msg)) => assert!(msg.contains("already a member")),
            other => panic!("Expected Conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_staff_cannot_rename_agency() {
        let (_, owner_client, _) = seeded();
        let staff = add_user(&owner_client, "staff@acme.test");
        owner_client.add_member(staff.id, Role::Staff).await.unwrap();
        let staff_client = owner_client.as_user(staff);
        assert!(matches!(
            staff_client.update_agency_name("Hijack".into()).await,
            Err(CrmError::Forbidden(_))
        ));
        let renamed = owner_client.update_agency_name(" Acme Labs ".into()).await.unwrap();
        assert_eq!(renamed.name, "Acme Labs");
    }

    #[tokio::test]
    async fn test_subscription_is_scoped_to_callers_agency() {
        let (_, client, _) = seeded();
        let rival = add_user(&client, "rival@other.test");
        let rival_client = client.as_user(rival);
        rival_client.create_agency("Other".into()).await.unwrap();

        let mut sub = client.subscribe(ChangeFilter::table(Table::Deals)).await.unwrap();
        rival_client
            .create_deal(NewDeal { title: "Theirs".into(), ..Default::default() })
            .await
            .unwrap();
        let ours = client
            .create_deal(NewDeal { title: "Ours".into(), ..Default::default() })
            .await
            .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        let event = event.change().unwrap();
        assert_eq!(event.record["id"], serde_json::json!(ours.id));
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn test_removed_member_stops_receiving_agency_rows() {
        let (_, owner, _) = seeded();
        let staff = add_user(&owner, "staff@acme.test");
        let member = owner.add_member(staff.id, Role::Staff).await.unwrap();
        let staff_client = owner.as_user(staff);
        let mut sub = staff_client.subscribe(ChangeFilter::table(Table::Deals)).await.unwrap();

        owner.remove_member(member.id).await.unwrap();
        assert!(staff_client.list_deals().await.is_err());
        owner
            .create_deal(NewDeal { title: "Secret".into(), value: 9000.0, ..Default::default() })
            .await
            .unwrap();

        let next = tokio::time::timeout(std::time::Duration::from_secs(1), sub.next())
            .await
            .unwrap();
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn test_joining_an_agency_after_subscribing_receives_its_rows() {
        let (_, owner, _) = seeded();
        let newcomer = add_user(&owner, "new@acme.test");
        let newcomer_client = owner.as_user(newcomer.clone());
        let mut sub = newcomer_client.subscribe(ChangeFilter::table(Table::Deals)).await.unwrap();

        owner.add_member(newcomer.id, Role::Staff).await.unwrap();
        let deal = owner
            .create_deal(NewDeal { title: "Welcome".into(), ..Default::default() })
            .await
            .unwrap();

        let message = tokio::time::timeout(std::time::Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.change().unwrap().record["id"], serde_json::json!(deal.id));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_gets_resync_marker() {
        let (_, owner, _) = seeded();
        let mut sub = owner.subscribe(ChangeFilter::table(Table::Contacts)).await.unwrap();
        let feed = owner.feed().clone();
        let agency_id = owner.membership().await.unwrap().unwrap().agency_id;

        // published without yielding, so the ring overflows before the pump runs
        let burst = crate::crm::feed::FEED_CAPACITY + 64;
        for i in 0..burst {
            feed.publish(ChangeEvent::new(
                Table::Contacts,
                ChangeKind::Insert,
                Some(agency_id),
                &serde_json::json!({ "id": i }),
            ));
        }

        let mut resynced = false;
        let mut delivered = 0;
        while let Ok(Some(message)) =
            tokio::time::timeout(std::time::Duration::from_millis(500), sub.next()).await
        {
            match message {
                RealtimeMessage::Resync { skipped } => {
                    assert!(skipped > 0);
                    resynced = true;
                }
                RealtimeMessage::Change(_) => delivered += 1,
            }
        }
        assert!(resynced);
        assert!(delivered < burst);
    }

    #[tokio::test]
    async fn test_checkout_without_service_is_not_configured() {
        let (_, client, _) = seeded();
        let result = client
            .start_checkout(CheckoutRequest {
                price_id: "p".into(),
                return_url: "https://x".into(),
            })
            .await;
        assert!(matches!(result, Err(CheckoutError::NotConfigured)));
    }
}
