use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use uuid::Uuid;

use super::models::*;
use crate::errors::CrmError;

/// Async-safe handle to the CRM database.
///
/// Wraps `CrmDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<CrmDb>>,
}

impl DbHandle {
    pub fn new(db: CrmDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`). Typed `CrmError`s
    /// raised inside the closure come back out unchanged.
    pub async fn call<F, R>(&self, f: F) -> Result<R, CrmError>
    where
        F: FnOnce(&CrmDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")
        .map_err(CrmError::Database)?
        .map_err(CrmError::from)
    }

    /// Acquire the database mutex synchronously. Used for startup
    /// initialization, the CLI and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, CrmDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Everything a quiz submission wrote, so callers can announce each insert.
#[derive(Debug, Clone)]
pub struct SubmissionRecords {
    pub contact: Contact,
    pub deal: Deal,
    pub response: QuizResponse,
    pub notification: Notification,
}

impl SubmissionRecords {
    pub fn receipt(&self) -> SubmissionReceipt {
        SubmissionReceipt {
            contact_id: self.contact.id,
            deal_id: self.deal.id,
            response_id: self.response.id,
        }
    }
}

pub struct CrmDb {
    conn: Connection,
}

impl CrmDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS auth_users (
                    id TEXT PRIMARY KEY,
                    email TEXT NOT NULL UNIQUE,
                    token_hash TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS profiles (
                    id TEXT PRIMARY KEY,
                    theme_mode TEXT NOT NULL DEFAULT 'dark',
                    theme_style TEXT NOT NULL DEFAULT 'retro',
                    avatar_url TEXT,
                    updated_at TEXT
                );

                CREATE TABLE IF NOT EXISTS agencies (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    subscription_tier TEXT NOT NULL DEFAULT 'free',
                    subscription_status TEXT NOT NULL DEFAULT 'inactive',
                    payment_customer_id TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS agency_users (
                    id TEXT PRIMARY KEY,
                    agency_id TEXT NOT NULL REFERENCES agencies(id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                    UNIQUE(agency_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS invitations (
                    token TEXT PRIMARY KEY,
                    agency_id TEXT NOT NULL REFERENCES agencies(id) ON DELETE CASCADE,
                    email TEXT NOT NULL,
                    role TEXT NOT NULL,
                    created_by TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                    accepted_at TEXT
                );

                CREATE TABLE IF NOT EXISTS contacts (
                    id TEXT PRIMARY KEY,
                    agency_id TEXT NOT NULL REFERENCES agencies(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    email TEXT,
                    phone TEXT,
                    status TEXT NOT NULL DEFAULT 'lead',
                    score INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS deals (
                    id TEXT PRIMARY KEY,
                    agency_id TEXT NOT NULL REFERENCES agencies(id) ON DELETE CASCADE,
                    contact_id TEXT REFERENCES contacts(id) ON DELETE SET NULL,
                    title TEXT NOT NULL,
                    value REAL NOT NULL DEFAULT 0 CHECK (value >= 0),
                    stage TEXT NOT NULL DEFAULT 'new_leads',
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS contracts (
                    id TEXT PRIMARY KEY,
                    agency_id TEXT NOT NULL REFERENCES agencies(id) ON DELETE CASCADE,
                    contact_id TEXT REFERENCES contacts(id) ON DELETE SET NULL,
                    title TEXT NOT NULL,
                    mrr REAL NOT NULL DEFAULT 0 CHECK (mrr >= 0),
                    status TEXT NOT NULL DEFAULT 'active',
                    start_date TEXT NOT NULL,
                    renewal_date TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS quizzes (
                    id TEXT PRIMARY KEY,
                    agency_id TEXT NOT NULL REFERENCES agencies(id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    is_published INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS quiz_questions (
                    id TEXT PRIMARY KEY,
                    quiz_id TEXT NOT NULL REFERENCES quizzes(id) ON DELETE CASCADE,
                    text TEXT NOT NULL,
                    kind TEXT NOT NULL DEFAULT 'multiple_choice',
                    position INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS quiz_options (
                    id TEXT PRIMARY KEY,
                    question_id TEXT NOT NULL REFERENCES quiz_questions(id) ON DELETE CASCADE,
                    text TEXT NOT NULL,
                    points INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS quiz_responses (
                    id TEXT PRIMARY KEY,
                    quiz_id TEXT NOT NULL REFERENCES quizzes(id) ON DELETE CASCADE,
                    contact_id TEXT NOT NULL,
                    agency_id TEXT NOT NULL,
                    respondent_name TEXT NOT NULL,
                    respondent_email TEXT NOT NULL,
                    respondent_whatsapp TEXT NOT NULL,
                    total_score INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS quiz_answers (
                    id TEXT PRIMARY KEY,
                    response_id TEXT NOT NULL REFERENCES quiz_responses(id) ON DELETE CASCADE,
                    question_id TEXT NOT NULL REFERENCES quiz_questions(id) ON DELETE CASCADE,
                    option_id TEXT REFERENCES quiz_options(id) ON DELETE SET NULL,
                    text_value TEXT
                );

                CREATE TABLE IF NOT EXISTS notifications (
                    id TEXT PRIMARY KEY,
                    agency_id TEXT NOT NULL REFERENCES agencies(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    message TEXT NOT NULL DEFAULT '',
                    kind TEXT NOT NULL DEFAULT 'system',
                    read INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE INDEX IF NOT EXISTS idx_agency_users_user ON agency_users(user_id);
                CREATE INDEX IF NOT EXISTS idx_contacts_agency ON contacts(agency_id);
                CREATE INDEX IF NOT EXISTS idx_deals_agency ON deals(agency_id);
                CREATE INDEX IF NOT EXISTS idx_contracts_agency ON contracts(agency_id);
                CREATE INDEX IF NOT EXISTS idx_quizzes_agency ON quizzes(agency_id);
                CREATE INDEX IF NOT EXISTS idx_quiz_questions_quiz ON quiz_questions(quiz_id);
                CREATE INDEX IF NOT EXISTS idx_quiz_options_question ON quiz_options(question_id);
                CREATE INDEX IF NOT EXISTS idx_quiz_responses_quiz ON quiz_responses(quiz_id);
                CREATE INDEX IF NOT EXISTS idx_notifications_agency ON notifications(agency_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Auth users ────────────────────────────────────────────────────

    pub fn create_auth_user(&self, email: &str, token_hash: &str) -> Result<AuthUser> {
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO auth_users (id, email, token_hash) VALUES (?1, ?2, ?3)",
                params![id.to_string(), email, token_hash],
            )
            .map_err(|e| conflict_on_unique(e, "A user with this email already exists"))
            .context("Failed to insert auth user")?;
        self.get_auth_user(id)?
            .context("Auth user not found after insert")
    }

    pub fn get_auth_user(&self, id: Uuid) -> Result<Option<AuthUser>> {
        self.conn
            .query_row(
                "SELECT id, email FROM auth_users WHERE id = ?1",
                params![id.to_string()],
                auth_user_from_row,
            )
            .optional()
            .context("Failed to query auth user")
    }

    pub fn auth_user_by_token_hash(&self, token_hash: &str) -> Result<Option<AuthUser>> {
        self.conn
            .query_row(
                "SELECT id, email FROM auth_users WHERE token_hash = ?1",
                params![token_hash],
                auth_user_from_row,
            )
            .optional()
            .context("Failed to query auth user by token")
    }

    pub fn list_auth_users(&self) -> Result<Vec<AuthUser>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, email FROM auth_users ORDER BY created_at, rowid")
            .context("Failed to prepare list_auth_users")?;
        let rows = stmt
            .query_map([], auth_user_from_row)
            .context("Failed to query auth users")?;
        collect_rows(rows, "auth user")
    }

    // ── Profiles ──────────────────────────────────────────────────────

    pub fn get_profile(&self, user_id: Uuid) -> Result<Option<Profile>> {
        self.conn
            .query_row(
                "SELECT id, theme_mode, theme_style, avatar_url, updated_at FROM profiles WHERE id = ?1",
                params![user_id.to_string()],
                profile_from_row,
            )
            .optional()
            .context("Failed to query profile")
    }

    /// Update the theme of an existing profile. Returns `false` when the
    /// user has no profile row yet.
    pub fn update_profile_theme(
        &self,
        user_id: Uuid,
        mode: ThemeMode,
        style: ThemeStyle,
    ) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE profiles SET theme_mode = ?1, theme_style = ?2,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ?3",
                params![mode.as_str(), style.as_str(), user_id.to_string()],
            )
            .context("Failed to update profile theme")?;
        Ok(count > 0)
    }

    pub fn upsert_profile(&self, profile: &Profile) -> Result<Profile> {
        self.conn
            .execute(
                "INSERT INTO profiles (id, theme_mode, theme_style, avatar_url, updated_at)
                 VALUES (?1, ?2, ?3, ?4, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                 ON CONFLICT(id) DO UPDATE SET
                    theme_mode = excluded.theme_mode,
                    theme_style = excluded.theme_style,
                    avatar_url = excluded.avatar_url,
                    updated_at = excluded.updated_at",
                params![
                    profile.id.to_string(),
                    profile.theme_mode.as_str(),
                    profile.theme_style.as_str(),
                    profile.avatar_url,
                ],
            )
            .context("Failed to upsert profile")?;
        self.get_profile(profile.id)?
            .context("Profile not found after upsert")
    }

    // ── Agencies & membership ─────────────────────────────────────────

    /// Create an agency and make `owner_id` its owner, atomically. A user
    /// belongs to at most one agency.
    pub fn create_agency(&self, name: &str, owner_id: Uuid) -> Result<(Agency, Member)> {
        if self.membership_for_user(owner_id)?.is_some() {
            return Err(CrmError::Conflict("User already belongs to an agency".into()).into());
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let agency_id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO agencies (id, name) VALUES (?1, ?2)",
            params![agency_id.to_string(), name],
        )
        .context("Failed to insert agency")?;
        let member_id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO agency_users (id, agency_id, user_id, role) VALUES (?1, ?2, ?3, ?4)",
            params![
                member_id.to_string(),
                agency_id.to_string(),
                owner_id.to_string(),
                Role::Owner.as_str()
            ],
        )
        .context("Failed to insert owner membership")?;
        tx.commit().context("Failed to commit agency creation")?;

        let agency = self
            .get_agency(agency_id)?
            .context("Agency not found after insert")?;
        let member = self
            .get_member(member_id)?
            .context("Member not found after insert")?;
        Ok((agency, member))
    }

    pub fn get_agency(&self, id: Uuid) -> Result<Option<Agency>> {
        self.conn
            .query_row(
                "SELECT id, name, subscription_tier, subscription_status, payment_customer_id, created_at
                 FROM agencies WHERE id = ?1",
                params![id.to_string()],
                agency_from_row,
            )
            .optional()
            .context("Failed to query agency")
    }

    pub fn update_agency_name(&self, id: Uuid, name: &str) -> Result<Option<Agency>> {
        let count = self
            .conn
            .execute(
                "UPDATE agencies SET name = ?1 WHERE id = ?2",
                params![name, id.to_string()],
            )
            .context("Failed to update agency name")?;
        if count == 0 {
            return Ok(None);
        }
        self.get_agency(id)
    }

    pub fn set_payment_customer(&self, id: Uuid, customer_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE agencies SET payment_customer_id = ?1 WHERE id = ?2",
                params![customer_id, id.to_string()],
            )
            .context("Failed to store payment customer")?;
        Ok(())
    }

    pub fn set_subscription(&self, id: Uuid, tier: PlanTier, status: &str) -> Result<Option<Agency>> {
        let count = self
            .conn
            .execute(
                "UPDATE agencies SET subscription_tier = ?1, subscription_status = ?2 WHERE id = ?3",
                params![tier.as_str(), status, id.to_string()],
            )
            .context("Failed to update subscription")?;
        if count == 0 {
            return Ok(None);
        }
        self.get_agency(id)
    }

    /// The user's membership, oldest first if several exist.
    pub fn membership_for_user(&self, user_id: Uuid) -> Result<Option<Member>> {
        self.conn
            .query_row(
                "SELECT m.id, m.agency_id, m.user_id, m.role, u.email
                 FROM agency_users m LEFT JOIN auth_users u ON u.id = m.user_id
                 WHERE m.user_id = ?1 ORDER BY m.created_at, m.rowid LIMIT 1",
                params![user_id.to_string()],
                member_from_row,
            )
            .optional()
            .context("Failed to query membership")
    }

    pub fn get_member(&self, id: Uuid) -> Result<Option<Member>> {
        self.conn
            .query_row(
                "SELECT m.id, m.agency_id, m.user_id, m.role, u.email
                 FROM agency_users m LEFT JOIN auth_users u ON u.id = m.user_id
                 WHERE m.id = ?1",
                params![id.to_string()],
                member_from_row,
            )
            .optional()
            .context("Failed to query member")
    }

    pub fn list_members(&self, agency_id: Uuid) -> Result<Vec<Member>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT m.id, m.agency_id, m.user_id, m.role, u.email
                 FROM agency_users m LEFT JOIN auth_users u ON u.id = m.user_id
                 WHERE m.agency_id = ?1 ORDER BY m.created_at, m.rowid",
            )
            .context("Failed to prepare list_members")?;
        let rows = stmt
            .query_map(params![agency_id.to_string()], member_from_row)
            .context("Failed to query members")?;
        collect_rows(rows, "member")
    }

    pub fn add_member(&self, agency_id: Uuid, user_id: Uuid, role: Role) -> Result<Member> {
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO agency_users (id, agency_id, user_id, role) VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.to_string(),
                    agency_id.to_string(),
                    user_id.to_string(),
                    role.as_str()
                ],
            )
            .map_err(|e| conflict_on_unique(e, "User is already a member of this agency"))
            .context("Failed to insert member")?;
        self.get_member(id)?.context("Member not found after insert")
    }

    pub fn remove_member(&self, agency_id: Uuid, id: Uuid) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM agency_users WHERE id = ?1 AND agency_id = ?2",
                params![id.to_string(), agency_id.to_string()],
            )
            .context("Failed to delete member")?;
        Ok(count > 0)
    }

    // ── Invitations ───────────────────────────────────────────────────

    pub fn create_invitation(
        &self,
        agency_id: Uuid,
        email: &str,
        role: Role,
        created_by: Uuid,
    ) -> Result<Invitation> {
        let token = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO invitations (token, agency_id, email, role, created_by)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    token.to_string(),
                    agency_id.to_string(),
                    email,
                    role.as_str(),
                    created_by.to_string()
                ],
            )
            .context("Failed to insert invitation")?;
        self.get_invitation(token)?
            .context("Invitation not found after insert")
    }

    pub fn get_invitation(&self, token: Uuid) -> Result<Option<Invitation>> {
        self.conn
            .query_row(
                "SELECT token, agency_id, email, role, created_by, created_at, accepted_at
                 FROM invitations WHERE token = ?1",
                params![token.to_string()],
                |row| {
                    Ok(Invitation {
                        token: uuid_col(row, 0)?,
                        agency_id: uuid_col(row, 1)?,
                        email: row.get(2)?,
                        role: enum_col(row, 3)?,
                        created_by: uuid_col(row, 4)?,
                        created_at: row.get(5)?,
                        accepted_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to query invitation")
    }

    pub fn invitation_details(&self, token: Uuid) -> Result<Option<InvitationDetails>> {
        self.conn
            .query_row(
                "SELECT a.name, i.email, i.role, i.accepted_at
                 FROM invitations i JOIN agencies a ON a.id = i.agency_id
                 WHERE i.token = ?1",
                params![token.to_string()],
                |row| {
                    Ok(InvitationDetails {
                        agency_name: row.get(0)?,
                        email: row.get(1)?,
                        role: enum_col(row, 2)?,
                        accepted: row.get::<_, Option<String>>(3)?.is_some(),
                    })
                },
            )
            .optional()
            .context("Failed to query invitation details")
    }

    /// Accept an invitation on behalf of `user`, creating the membership.
    /// The invitation must be addressed to the user's email and unused.
    pub fn accept_invitation(&self, token: Uuid, user: &AuthUser) -> Result<Member> {
        let invitation = self
            .get_invitation(token)?
            .ok_or_else(|| CrmError::not_found("Invitation", token))?;
        if invitation.accepted_at.is_some() {
            return Err(CrmError::Conflict("Invitation has already been accepted".into()).into());
        }
        if !invitation.email.eq_ignore_ascii_case(&user.email) {
            return Err(
                CrmError::Forbidden("invitation was issued to a different email".into()).into(),
            );
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let member = self.add_member(invitation.agency_id, user.id, invitation.role)?;
        tx.execute(
            "UPDATE invitations SET accepted_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE token = ?1",
            params![token.to_string()],
        )
        .context("Failed to mark invitation accepted")?;
        tx.commit().context("Failed to commit invitation acceptance")?;
        Ok(member)
    }

    // ── Contacts ──────────────────────────────────────────────────────

    pub fn list_contacts(&self, agency_id: Uuid) -> Result<Vec<Contact>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, agency_id, name, email, phone, status, score, created_at
                 FROM contacts WHERE agency_id = ?1 ORDER BY created_at DESC, rowid DESC",
            )
            .context("Failed to prepare list_contacts")?;
        let rows = stmt
            .query_map(params![agency_id.to_string()], contact_from_row)
            .context("Failed to query contacts")?;
        collect_rows(rows, "contact")
    }

    pub fn get_contact(&self, id: Uuid) -> Result<Option<Contact>> {
        self.conn
            .query_row(
                "SELECT id, agency_id, name, email, phone, status, score, created_at
                 FROM contacts WHERE id = ?1",
                params![id.to_string()],
                contact_from_row,
            )
            .optional()
            .context("Failed to query contact")
    }

    pub fn create_contact(&self, agency_id: Uuid, input: &NewContact) -> Result<Contact> {
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO contacts (id, agency_id, name, email, phone, status, score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.to_string(),
                    agency_id.to_string(),
                    input.name,
                    input.email,
                    input.phone,
                    input.status.as_str(),
                    input.score
                ],
            )
            .context("Failed to insert contact")?;
        self.get_contact(id)?.context("Contact not found after insert")
    }

    pub fn delete_contact(&self, agency_id: Uuid, id: Uuid) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM contacts WHERE id = ?1 AND agency_id = ?2",
                params![id.to_string(), agency_id.to_string()],
            )
            .context("Failed to delete contact")?;
        Ok(count > 0)
    }

    pub fn count_contacts(&self, agency_id: Uuid) -> Result<i64> {
        self.count_where("contacts", agency_id)
    }

    // ── Deals ─────────────────────────────────────────────────────────

    /// All deals of an agency joined with their contact's name, newest first.
    pub fn list_deals(&self, agency_id: Uuid) -> Result<Vec<DealWithContact>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT d.id, d.agency_id, d.contact_id, d.title, d.value, d.stage, d.created_at, c.name
                 FROM deals d LEFT JOIN contacts c ON c.id = d.contact_id
                 WHERE d.agency_id = ?1 ORDER BY d.created_at DESC, d.rowid DESC",
            )
            .context("Failed to prepare list_deals")?;
        let rows = stmt
            .query_map(params![agency_id.to_string()], |row| {
                Ok(DealWithContact {
                    deal: deal_from_row(row)?,
                    contact_name: row.get(7)?,
                })
            })
            .context("Failed to query deals")?;
        collect_rows(rows, "deal")
    }

    pub fn get_deal(&self, id: Uuid) -> Result<Option<Deal>> {
        self.conn
            .query_row(
                "SELECT id, agency_id, contact_id, title, value, stage, created_at
                 FROM deals WHERE id = ?1",
                params![id.to_string()],
                deal_from_row,
            )
            .optional()
            .context("Failed to query deal")
    }

    pub fn create_deal(&self, agency_id: Uuid, input: &NewDeal) -> Result<Deal> {
        let id = Uuid::new_v4();
        let stage = input.stage.unwrap_or_else(Stage::first);
        self.conn
            .execute(
                "INSERT INTO deals (id, agency_id, contact_id, title, value, stage)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    agency_id.to_string(),
                    input.contact_id.map(|c| c.to_string()),
                    input.title,
                    input.value,
                    stage.as_str()
                ],
            )
            .context("Failed to insert deal")?;
        self.get_deal(id)?.context("Deal not found after insert")
    }

    /// Move a deal to another stage. Only the stage column is written.
    pub fn update_deal_stage(&self, agency_id: Uuid, id: Uuid, stage: Stage) -> Result<Option<Deal>> {
        let count = self
            .conn
            .execute(
                "UPDATE deals SET stage = ?1 WHERE id = ?2 AND agency_id = ?3",
                params![stage.as_str(), id.to_string(), agency_id.to_string()],
            )
            .context("Failed to update deal stage")?;
        if count == 0 {
            return Ok(None);
        }
        self.get_deal(id)
    }

    pub fn delete_deal(&self, agency_id: Uuid, id: Uuid) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM deals WHERE id = ?1 AND agency_id = ?2",
                params![id.to_string(), agency_id.to_string()],
            )
            .context("Failed to delete deal")?;
        Ok(count > 0)
    }

    // ── Contracts ─────────────────────────────────────────────────────

    pub fn list_contracts(&self, agency_id: Uuid) -> Result<Vec<ContractWithContact>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT k.id, k.agency_id, k.contact_id, k.title, k.mrr, k.status, k.start_date,
                        k.renewal_date, k.created_at, c.name
                 FROM contracts k LEFT JOIN contacts c ON c.id = k.contact_id
                 WHERE k.agency_id = ?1 ORDER BY k.created_at DESC, k.rowid DESC",
            )
            .context("Failed to prepare list_contracts")?;
        let rows = stmt
            .query_map(params![agency_id.to_string()], |row| {
                Ok(ContractWithContact {
                    contract: contract_from_row(row)?,
                    contact_name: row.get(9)?,
                })
            })
            .context("Failed to query contracts")?;
        collect_rows(rows, "contract")
    }

    pub fn get_contract(&self, id: Uuid) -> Result<Option<Contract>> {
        self.conn
            .query_row(
                "SELECT id, agency_id, contact_id, title, mrr, status, start_date, renewal_date, created_at
                 FROM contracts WHERE id = ?1",
                params![id.to_string()],
                contract_from_row,
            )
            .optional()
            .context("Failed to query contract")
    }

    pub fn create_contract(&self, agency_id: Uuid, input: &ContractInput) -> Result<Contract> {
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO contracts (id, agency_id, contact_id, title, mrr, status, start_date, renewal_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.to_string(),
                    agency_id.to_string(),
                    input.contact_id.map(|c| c.to_string()),
                    input.title,
                    input.mrr,
                    input.status.as_str(),
                    input.start_date.to_string(),
                    input.renewal_date.map(|d| d.to_string())
                ],
            )
            .context("Failed to insert contract")?;
        self.get_contract(id)?
            .context("Contract not found after insert")
    }

    pub fn update_contract(
        &self,
        agency_id: Uuid,
        id: Uuid,
        input: &ContractInput,
    ) -> Result<Option<Contract>> {
        let count = self
            .conn
            .execute(
                "UPDATE contracts SET contact_id = ?1, title = ?2, mrr = ?3, status = ?4,
                 start_date = ?5, renewal_date = ?6 WHERE id = ?7 AND agency_id = ?8",
                params![
                    input.contact_id.map(|c| c.to_string()),
                    input.title,
                    input.mrr,
                    input.status.as_str(),
                    input.start_date.to_string(),
                    input.renewal_date.map(|d| d.to_string()),
                    id.to_string(),
                    agency_id.to_string()
                ],
            )
            .context("Failed to update contract")?;
        if count == 0 {
            return Ok(None);
        }
        self.get_contract(id)
    }

    pub fn delete_contract(&self, agency_id: Uuid, id: Uuid) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM contracts WHERE id = ?1 AND agency_id = ?2",
                params![id.to_string(), agency_id.to_string()],
            )
            .context("Failed to delete contract")?;
        Ok(count > 0)
    }

    pub fn count_contracts(&self, agency_id: Uuid) -> Result<i64> {
        self.count_where("contracts", agency_id)
    }

    // ── Quizzes ───────────────────────────────────────────────────────

    pub fn list_quizzes(&self, agency_id: Uuid) -> Result<Vec<QuizSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT q.id, q.agency_id, q.user_id, q.title, q.description, q.is_published, q.created_at,
                        (SELECT COUNT(*) FROM quiz_questions qq WHERE qq.quiz_id = q.id),
                        (SELECT COUNT(*) FROM quiz_responses r WHERE r.quiz_id = q.id)
                 FROM quizzes q WHERE q.agency_id = ?1 ORDER BY q.created_at DESC, q.rowid DESC",
            )
            .context("Failed to prepare list_quizzes")?;
        let rows = stmt
            .query_map(params![agency_id.to_string()], |row| {
                Ok(QuizSummary {
                    quiz: quiz_from_row(row)?,
                    question_count: row.get(7)?,
                    response_count: row.get(8)?,
                })
            })
            .context("Failed to query quizzes")?;
        collect_rows(rows, "quiz")
    }

    pub fn count_quizzes(&self, agency_id: Uuid) -> Result<i64> {
        self.count_where("quizzes", agency_id)
    }

    pub fn create_quiz(
        &self,
        agency_id: Uuid,
        user_id: Uuid,
        title: &str,
        description: &str,
    ) -> Result<Quiz> {
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO quizzes (id, agency_id, user_id, title, description) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.to_string(),
                    agency_id.to_string(),
                    user_id.to_string(),
                    title,
                    description
                ],
            )
            .context("Failed to insert quiz")?;
        self.get_quiz(id)?.context("Quiz not found after insert")
    }

    pub fn get_quiz(&self, id: Uuid) -> Result<Option<Quiz>> {
        self.conn
            .query_row(
                "SELECT id, agency_id, user_id, title, description, is_published, created_at
                 FROM quizzes WHERE id = ?1",
                params![id.to_string()],
                quiz_from_row,
            )
            .optional()
            .context("Failed to query quiz")
    }

    pub fn quiz_detail(&self, id: Uuid) -> Result<Option<QuizDetail>> {
        let Some(quiz) = self.get_quiz(id)? else {
            return Ok(None);
        };
        let questions = self.list_questions(id)?;
        Ok(Some(QuizDetail { quiz, questions }))
    }

    pub fn update_quiz(&self, id: Uuid, update: &QuizUpdate) -> Result<Option<Quiz>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(title) = &update.title {
            tx.execute(
                "UPDATE quizzes SET title = ?1 WHERE id = ?2",
                params![title, id.to_string()],
            )
            .context("Failed to update quiz title")?;
        }
        if let Some(description) = &update.description {
            tx.execute(
                "UPDATE quizzes SET description = ?1 WHERE id = ?2",
                params![description, id.to_string()],
            )
            .context("Failed to update quiz description")?;
        }
        if let Some(published) = update.is_published {
            tx.execute(
                "UPDATE quizzes SET is_published = ?1 WHERE id = ?2",
                params![published, id.to_string()],
            )
            .context("Failed to update quiz publication")?;
        }
        tx.commit().context("Failed to commit quiz update")?;
        self.get_quiz(id)
    }

    /// Delete a quiz together with its questions, options, responses and answers.
    pub fn delete_quiz(&self, id: Uuid) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM quizzes WHERE id = ?1", params![id.to_string()])
            .context("Failed to delete quiz")?;
        Ok(count > 0)
    }

    /// Questions of a quiz in position order, each with its options in
    /// insertion order.
    pub fn list_questions(&self, quiz_id: Uuid) -> Result<Vec<Question>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, quiz_id, text, kind, position FROM quiz_questions
                 WHERE quiz_id = ?1 ORDER BY position, rowid",
            )
            .context("Failed to prepare list_questions")?;
        let rows = stmt
            .query_map(params![quiz_id.to_string()], question_from_row)
            .context("Failed to query questions")?;
        let mut questions = collect_rows(rows, "question")?;
        for question in &mut questions {
            question.options = self.list_options(question.id)?;
        }
        Ok(questions)
    }

    fn list_options(&self, question_id: Uuid) -> Result<Vec<QuizOption>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, question_id, text, points FROM quiz_options
                 WHERE question_id = ?1 ORDER BY rowid",
            )
            .context("Failed to prepare list_options")?;
        let rows = stmt
            .query_map(params![question_id.to_string()], option_from_row)
            .context("Failed to query options")?;
        collect_rows(rows, "option")
    }

    pub fn get_question(&self, id: Uuid) -> Result<Option<Question>> {
        let question = self
            .conn
            .query_row(
                "SELECT id, quiz_id, text, kind, position FROM quiz_questions WHERE id = ?1",
                params![id.to_string()],
                question_from_row,
            )
            .optional()
            .context("Failed to query question")?;
        match question {
            Some(mut q) => {
                q.options = self.list_options(q.id)?;
                Ok(Some(q))
            }
            None => Ok(None),
        }
    }

    pub fn get_option(&self, id: Uuid) -> Result<Option<QuizOption>> {
        self.conn
            .query_row(
                "SELECT id, question_id, text, points FROM quiz_options WHERE id = ?1",
                params![id.to_string()],
                option_from_row,
            )
            .optional()
            .context("Failed to query option")
    }

    /// Agency owning the quiz a question belongs to.
    pub fn question_agency(&self, question_id: Uuid) -> Result<Option<Uuid>> {
        self.conn
            .query_row(
                "SELECT q.agency_id FROM quiz_questions qq JOIN quizzes q ON q.id = qq.quiz_id
                 WHERE qq.id = ?1",
                params![question_id.to_string()],
                |row| uuid_col(row, 0),
            )
            .optional()
            .context("Failed to resolve question agency")
    }

    /// Agency owning the quiz an option belongs to.
    pub fn option_agency(&self, option_id: Uuid) -> Result<Option<Uuid>> {
        self.conn
            .query_row(
                "SELECT q.agency_id FROM quiz_options o
                 JOIN quiz_questions qq ON qq.id = o.question_id
                 JOIN quizzes q ON q.id = qq.quiz_id
                 WHERE o.id = ?1",
                params![option_id.to_string()],
                |row| uuid_col(row, 0),
            )
            .optional()
            .context("Failed to resolve option agency")
    }

    /// Append a question at the end of the quiz.
    pub fn add_question(&self, quiz_id: Uuid, input: &NewQuestion) -> Result<Question> {
        let max_pos: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) FROM quiz_questions WHERE quiz_id = ?1",
                params![quiz_id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to get max question position")?;
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO quiz_questions (id, quiz_id, text, kind, position) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.to_string(),
                    quiz_id.to_string(),
                    input.text,
                    input.kind.as_str(),
                    max_pos + 1
                ],
            )
            .context("Failed to insert question")?;
        self.get_question(id)?
            .context("Question not found after insert")
    }

    pub fn update_question(&self, id: Uuid, update: &QuestionUpdate) -> Result<Option<Question>> {
        if let Some(text) = &update.text {
            self.conn
                .execute(
                    "UPDATE quiz_questions SET text = ?1 WHERE id = ?2",
                    params![text, id.to_string()],
                )
                .context("Failed to update question text")?;
        }
        if let Some(kind) = update.kind {
            self.conn
                .execute(
                    "UPDATE quiz_questions SET kind = ?1 WHERE id = ?2",
                    params![kind.as_str(), id.to_string()],
                )
                .context("Failed to update question kind")?;
        }
        self.get_question(id)
    }

    pub fn delete_question(&self, id: Uuid) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM quiz_questions WHERE id = ?1", params![id.to_string()])
            .context("Failed to delete question")?;
        Ok(count > 0)
    }

    /// Rewrite question positions to 0..n in the given order. Every id must
    /// belong to the quiz.
    pub fn reorder_questions(&self, quiz_id: Uuid, order: &[Uuid]) -> Result<Vec<Question>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        for (position, question_id) in order.iter().enumerate() {
            let count = tx
                .execute(
                    "UPDATE quiz_questions SET position = ?1 WHERE id = ?2 AND quiz_id = ?3",
                    params![position as i32, question_id.to_string(), quiz_id.to_string()],
                )
                .context("Failed to update question position")?;
            if count == 0 {
                return Err(CrmError::Validation(format!(
                    "Question {} is not part of quiz {}",
                    question_id, quiz_id
                ))
                .into());
            }
        }
        tx.commit().context("Failed to commit question reorder")?;
        self.list_questions(quiz_id)
    }

    pub fn add_option(&self, question_id: Uuid, input: &NewOption) -> Result<QuizOption> {
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO quiz_options (id, question_id, text, points) VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), question_id.to_string(), input.text, input.points],
            )
            .context("Failed to insert option")?;
        self.get_option(id)?.context("Option not found after insert")
    }

    pub fn update_option(&self, id: Uuid, update: &OptionUpdate) -> Result<Option<QuizOption>> {
        if let Some(text) = &update.text {
            self.conn
                .execute(
                    "UPDATE quiz_options SET text = ?1 WHERE id = ?2",
                    params![text, id.to_string()],
                )
                .context("Failed to update option text")?;
        }
        if let Some(points) = update.points {
            self.conn
                .execute(
                    "UPDATE quiz_options SET points = ?1 WHERE id = ?2",
                    params![points, id.to_string()],
                )
                .context("Failed to update option points")?;
        }
        self.get_option(id)
    }

    pub fn delete_option(&self, id: Uuid) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM quiz_options WHERE id = ?1", params![id.to_string()])
            .context("Failed to delete option")?;
        Ok(count > 0)
    }

    pub fn list_responses(&self, quiz_id: Uuid) -> Result<Vec<QuizResponse>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, quiz_id, contact_id, agency_id, respondent_name, respondent_email,
                        respondent_whatsapp, total_score, created_at
                 FROM quiz_responses WHERE quiz_id = ?1 ORDER BY created_at DESC, rowid DESC",
            )
            .context("Failed to prepare list_responses")?;
        let rows = stmt
            .query_map(params![quiz_id.to_string()], response_from_row)
            .context("Failed to query responses")?;
        collect_rows(rows, "response")
    }

    fn get_response(&self, id: Uuid) -> Result<Option<QuizResponse>> {
        self.conn
            .query_row(
                "SELECT id, quiz_id, contact_id, agency_id, respondent_name, respondent_email,
                        respondent_whatsapp, total_score, created_at
                 FROM quiz_responses WHERE id = ?1",
                params![id.to_string()],
                response_from_row,
            )
            .optional()
            .context("Failed to query response")
    }

    /// A published quiz as respondents see it: agency name resolved (with
    /// fallback), questions by position, options alphabetically.
    pub fn published_quiz(&self, id: Uuid) -> Result<Option<PublicQuiz>> {
        let Some(quiz) = self.get_quiz(id)?.filter(|q| q.is_published) else {
            return Ok(None);
        };
        let agency_name = self
            .get_agency(quiz.agency_id)?
            .map(|a| a.name)
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_AGENCY_NAME.to_string());
        let mut questions = self.list_questions(id)?;
        for question in &mut questions {
            question.options.sort_by(|a, b| a.text.cmp(&b.text));
        }
        Ok(Some(PublicQuiz {
            quiz,
            agency_name,
            questions,
        }))
    }

    /// Record a completed quiz: contact, deal, response, answers and a
    /// `lead_new` notification in one transaction. The score is recomputed
    /// from the selected options.
    pub fn submit_response(&self, submission: &QuizSubmission) -> Result<SubmissionRecords> {
        let quiz = self
            .get_quiz(submission.quiz_id)?
            .filter(|q| q.is_published)
            .ok_or_else(|| CrmError::not_found("Quiz", submission.quiz_id))?;
        let questions = self.list_questions(quiz.id)?;

        let mut score = 0;
        for answer in &submission.answers {
            let question = questions
                .iter()
                .find(|q| q.id == answer.question_id)
                .ok_or_else(|| {
                    CrmError::Validation(format!(
                        "Question {} is not part of this quiz",
                        answer.question_id
                    ))
                })?;
            if let Some(option_id) = answer.option_id {
                let option = question
                    .options
                    .iter()
                    .find(|o| o.id == option_id)
                    .ok_or_else(|| {
                        CrmError::Validation(format!(
                            "Option {} does not belong to question {}",
                            option_id, question.id
                        ))
                    })?;
                score += option.points;
            }
        }
        if score != submission.total_score {
            tracing::debug!(
                quiz_id = %quiz.id,
                submitted = submission.total_score,
                computed = score,
                "Submitted quiz score differs from selected options"
            );
        }

        let respondent = &submission.respondent;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let contact = self.create_contact(
            quiz.agency_id,
            &NewContact {
                name: respondent.name.clone(),
                email: Some(respondent.email.clone()),
                phone: Some(respondent.whatsapp.clone()),
                status: LeadStatus::from_score(score),
                score,
            },
        )?;

        let deal = self.create_deal(
            quiz.agency_id,
            &NewDeal {
                title: format!("{} - Quiz: {}", respondent.name, quiz.title),
                value: 0.0,
                stage: Some(Stage::first()),
                contact_id: Some(contact.id),
            },
        )?;

        let response_id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO quiz_responses (id, quiz_id, contact_id, agency_id, respondent_name,
                respondent_email, respondent_whatsapp, total_score)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                response_id.to_string(),
                quiz.id.to_string(),
                contact.id.to_string(),
                quiz.agency_id.to_string(),
                respondent.name,
                respondent.email,
                respondent.whatsapp,
                score
            ],
        )
        .context("Failed to insert quiz response")?;

        for answer in &submission.answers {
            tx.execute(
                "INSERT INTO quiz_answers (id, response_id, question_id, option_id, text_value)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    response_id.to_string(),
                    answer.question_id.to_string(),
                    answer.option_id.map(|o| o.to_string()),
                    answer.text_value
                ],
            )
            .context("Failed to insert quiz answer")?;
        }

        let notification = self.create_notification(
            quiz.agency_id,
            "New lead",
            &format!(
                "{} completed \"{}\" with a score of {}",
                respondent.name, quiz.title, score
            ),
            NotificationKind::LeadNew,
        )?;

        tx.commit().context("Failed to commit quiz submission")?;

        let response = self
            .get_response(response_id)?
            .context("Quiz response not found after insert")?;
        Ok(SubmissionRecords {
            contact,
            deal,
            response,
            notification,
        })
    }

    pub fn count_answers(&self, response_id: Uuid) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM quiz_answers WHERE response_id = ?1",
                params![response_id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to count answers")
    }

    // ── Notifications ─────────────────────────────────────────────────

    pub fn list_notifications(&self, agency_id: Uuid, limit: usize) -> Result<Vec<Notification>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, agency_id, title, message, kind, read, created_at FROM notifications
                 WHERE agency_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            )
            .context("Failed to prepare list_notifications")?;
        let rows = stmt
            .query_map(
                params![agency_id.to_string(), limit as i64],
                notification_from_row,
            )
            .context("Failed to query notifications")?;
        collect_rows(rows, "notification")
    }

    pub fn create_notification(
        &self,
        agency_id: Uuid,
        title: &str,
        message: &str,
        kind: NotificationKind,
    ) -> Result<Notification> {
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO notifications (id, agency_id, title, message, kind) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), agency_id.to_string(), title, message, kind.as_str()],
            )
            .context("Failed to insert notification")?;
        self.conn
            .query_row(
                "SELECT id, agency_id, title, message, kind, read, created_at FROM notifications WHERE id = ?1",
                params![id.to_string()],
                notification_from_row,
            )
            .context("Notification not found after insert")
    }

    /// Mark the given notifications read. Ids outside the agency are ignored.
    pub fn mark_notifications_read(&self, agency_id: Uuid, ids: &[Uuid]) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut updated = 0;
        for id in ids {
            updated += tx
                .execute(
                    "UPDATE notifications SET read = 1 WHERE id = ?1 AND agency_id = ?2 AND read = 0",
                    params![id.to_string(), agency_id.to_string()],
                )
                .context("Failed to mark notification read")?;
        }
        tx.commit().context("Failed to commit notification update")?;
        Ok(updated)
    }

    pub fn mark_all_notifications_read(&self, agency_id: Uuid) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE notifications SET read = 1 WHERE agency_id = ?1 AND read = 0",
                params![agency_id.to_string()],
            )
            .context("Failed to mark notifications read")
    }

    // ── Helpers ───────────────────────────────────────────────────────

    fn count_where(&self, table: &'static str, agency_id: Uuid) -> Result<i64> {
        self.conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE agency_id = ?1", table),
                params![agency_id.to_string()],
                |row| row.get(0),
            )
            .with_context(|| format!("Failed to count {}", table))
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

fn conflict_on_unique(err: rusqlite::Error, message: &str) -> anyhow::Error {
    let unique = matches!(
        &err,
        rusqlite::Error::SqliteFailure(e, msg)
            if e.code == ErrorCode::ConstraintViolation
                && msg.as_deref().is_some_and(|m| m.contains("UNIQUE"))
    );
    if unique {
        CrmError::Conflict(message.to_string()).into()
    } else {
        anyhow::Error::new(err)
    }
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    what: &str,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.with_context(|| format!("Failed to read {} row", what))?);
    }
    Ok(out)
}

fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        Uuid::parse_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn enum_col<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    T::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        NaiveDate::from_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn auth_user_from_row(row: &Row<'_>) -> rusqlite::Result<AuthUser> {
    Ok(AuthUser {
        id: uuid_col(row, 0)?,
        email: row.get(1)?,
    })
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    Ok(Profile {
        id: uuid_col(row, 0)?,
        theme_mode: enum_col(row, 1)?,
        theme_style: enum_col(row, 2)?,
        avatar_url: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn agency_from_row(row: &Row<'_>) -> rusqlite::Result<Agency> {
    Ok(Agency {
        id: uuid_col(row, 0)?,
        name: row.get(1)?,
        subscription_tier: enum_col(row, 2)?,
        subscription_status: row.get(3)?,
        payment_customer_id: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn member_from_row(row: &Row<'_>) -> rusqlite::Result<Member> {
    Ok(Member {
        id: uuid_col(row, 0)?,
        agency_id: uuid_col(row, 1)?,
        user_id: uuid_col(row, 2)?,
        role: enum_col(row, 3)?,
        email: row.get(4)?,
    })
}

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: uuid_col(row, 0)?,
        agency_id: uuid_col(row, 1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        status: enum_col(row, 5)?,
        score: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn deal_from_row(row: &Row<'_>) -> rusqlite::Result<Deal> {
    Ok(Deal {
        id: uuid_col(row, 0)?,
        agency_id: uuid_col(row, 1)?,
        contact_id: opt_uuid_col(row, 2)?,
        title: row.get(3)?,
        value: row.get(4)?,
        stage: enum_col(row, 5)?,
        created_at: row.get(6)?,
    })
}

fn contract_from_row(row: &Row<'_>) -> rusqlite::Result<Contract> {
    Ok(Contract {
        id: uuid_col(row, 0)?,
        agency_id: uuid_col(row, 1)?,
        contact_id: opt_uuid_col(row, 2)?,
        title: row.get(3)?,
        mrr: row.get(4)?,
        status: enum_col(row, 5)?,
        start_date: date_col(row, 6)?,
        renewal_date: opt_date_col(row, 7)?,
        created_at: row.get(8)?,
    })
}

fn quiz_from_row(row: &Row<'_>) -> rusqlite::Result<Quiz> {
    Ok(Quiz {
        id: uuid_col(row, 0)?,
        agency_id: uuid_col(row, 1)?,
        user_id: uuid_col(row, 2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        is_published: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn question_from_row(row: &Row<'_>) -> rusqlite::Result<Question> {
    Ok(Question {
        id: uuid_col(row, 0)?,
        quiz_id: uuid_col(row, 1)?,
        text: row.get(2)?,
        kind: enum_col(row, 3)?,
        position: row.get(4)?,
        options: Vec::new(),
    })
}

fn option_from_row(row: &Row<'_>) -> rusqlite::Result<QuizOption> {
    Ok(QuizOption {
        id: uuid_col(row, 0)?,
        question_id: uuid_col(row, 1)?,
        text: row.get(2)?,
        points: row.get(3)?,
    })
}

fn response_from_row(row: &Row<'_>) -> rusqlite::Result<QuizResponse> {
    Ok(QuizResponse {
        id: uuid_col(row, 0)?,
        quiz_id: uuid_col(row, 1)?,
        contact_id: uuid_col(row, 2)?,
        agency_id: uuid_col(row, 3)?,
        respondent_name: row.get(4)?,
        respondent_email: row.get(5)?,
        respondent_whatsapp: row.get(6)?,
        total_score: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: uuid_col(row, 0)?,
        agency_id: uuid_col(row, 1)?,
        title: row.get(2)?,
        message: row.get(3)?,
        kind: enum_col(row, 4)?,
        read: row.get(5)?,
        created_at: row.get(6)?,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────
