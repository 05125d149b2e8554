use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Pipeline ──────────────────────────────────────────────────────────

/// One step of the fixed sales pipeline. Membership and order never change
/// at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NewLeads,
    Contacted,
    Qualified,
    Proposal,
    Negotiation,
    Closed,
}

impl Stage {
    /// Every stage in board order.
    pub const ALL: [Stage; 6] = [
        Stage::NewLeads,
        Stage::Contacted,
        Stage::Qualified,
        Stage::Proposal,
        Stage::Negotiation,
        Stage::Closed,
    ];

    /// Stage assigned to new deals.
    pub fn first() -> Self {
        Self::NewLeads
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewLeads => "new_leads",
            Self::Contacted => "contacted",
            Self::Qualified => "qualified",
            Self::Proposal => "proposal",
            Self::Negotiation => "negotiation",
            Self::Closed => "closed",
        }
    }

    /// Column heading.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NewLeads => "New Leads",
            Self::Contacted => "Contacted",
            Self::Qualified => "Qualified",
            Self::Proposal => "Proposal",
            Self::Negotiation => "Negotiation",
            Self::Closed => "Closed",
        }
    }

    /// Zero-based column index.
    pub fn index(&self) -> usize {
        Self::ALL
            .iter()
            .position(|s| s == self)
            .unwrap_or_default()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    /// Accepts the wire key (`new_leads`) or the column heading (`New Leads`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|stage| {
                stage.as_str() == trimmed || stage.label().eq_ignore_ascii_case(trimmed)
            })
            .ok_or_else(|| format!("Invalid stage: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: Uuid,
    pub agency_id: Uuid,
    pub contact_id: Option<Uuid>,
    pub title: String,
    pub value: f64,
    pub stage: Stage,
    pub created_at: String,
}

/// A deal joined with its contact's display name, as the board lists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealWithContact {
    #[serde(flatten)]
    pub deal: Deal,
    pub contact_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewDeal {
    pub title: String,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub contact_id: Option<Uuid>,
}

// API view types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardView {
    pub columns: Vec<ColumnView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnView {
    pub stage: Stage,
    pub label: String,
    pub total_value: f64,
    pub deals: Vec<DealWithContact>,
}

// ── Contacts ──────────────────────────────────────────────────────────

/// Lead temperature / lifecycle of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    #[default]
    Lead,
    Cold,
    Warm,
    Hot,
    Customer,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lead => "lead",
            Self::Cold => "cold",
            Self::Warm => "warm",
            Self::Hot => "hot",
            Self::Customer => "customer",
        }
    }

    /// Temperature of a quiz lead from its total score.
    pub fn from_score(score: i32) -> Self {
        if score >= 61 {
            Self::Hot
        } else if score >= 31 {
            Self::Warm
        } else {
            Self::Cold
        }
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lead" => Ok(Self::Lead),
            "cold" => Ok(Self::Cold),
            "warm" => Ok(Self::Warm),
            "hot" => Ok(Self::Hot),
            "customer" => Ok(Self::Customer),
            _ => Err(format!("Invalid lead status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub agency_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: LeadStatus,
    pub score: i32,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewContact {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub status: LeadStatus,
    #[serde(default)]
    pub score: i32,
}

// ── Contracts ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    #[default]
    Active,
    Negotiating,
    Cancelled,
}

impl ContractStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Negotiating => "negotiating",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for ContractStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "negotiating" => Ok(Self::Negotiating),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid contract status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: Uuid,
    pub agency_id: Uuid,
    pub contact_id: Option<Uuid>,
    pub title: String,
    pub mrr: f64,
    pub status: ContractStatus,
    pub start_date: NaiveDate,
    pub renewal_date: Option<NaiveDate>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractWithContact {
    #[serde(flatten)]
    pub contract: Contract,
    pub contact_name: Option<String>,
}

/// Create/update payload for a contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractInput {
    #[serde(default)]
    pub contact_id: Option<Uuid>,
    pub title: String,
    #[serde(default)]
    pub mrr: f64,
    #[serde(default)]
    pub status: ContractStatus,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub renewal_date: Option<NaiveDate>,
}

// ── Quizzes ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    #[default]
    MultipleChoice,
    ShortText,
}

impl QuestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MultipleChoice => "multiple_choice",
            Self::ShortText => "short_text",
        }
    }
}

impl FromStr for QuestionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "multiple_choice" => Ok(Self::MultipleChoice),
            "short_text" => Ok(Self::ShortText),
            _ => Err(format!("Invalid question kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quiz {
    pub id: Uuid,
    pub agency_id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub description: String,
    pub is_published: bool,
    pub created_at: String,
}

/// Quiz list row with its question and response counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizSummary {
    #[serde(flatten)]
    pub quiz: Quiz,
    pub question_count: i64,
    pub response_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizOption {
    pub id: Uuid,
    pub question_id: Uuid,
    pub text: String,
    pub points: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub text: String,
    pub kind: QuestionKind,
    pub position: i32,
    pub options: Vec<QuizOption>,
}

/// A quiz with its ordered questions, as the builder edits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizDetail {
    pub quiz: Quiz,
    pub questions: Vec<Question>,
}

/// What an anonymous respondent sees: a published quiz and its agency's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicQuiz {
    pub quiz: Quiz,
    pub agency_name: String,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuizUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_published: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewQuestion {
    pub text: String,
    #[serde(default)]
    pub kind: QuestionKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestionUpdate {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub kind: Option<QuestionKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOption {
    pub text: String,
    #[serde(default)]
    pub points: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionUpdate {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub points: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Respondent {
    pub name: String,
    pub email: String,
    pub whatsapp: String,
}

/// One stored answer: an option for multiple choice, text for free text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedAnswer {
    pub question_id: Uuid,
    pub option_id: Option<Uuid>,
    pub text_value: Option<String>,
}

/// Everything written when a respondent completes a quiz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizSubmission {
    pub quiz_id: Uuid,
    pub respondent: Respondent,
    pub total_score: i32,
    pub answers: Vec<SubmittedAnswer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub contact_id: Uuid,
    pub deal_id: Uuid,
    pub response_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizResponse {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub contact_id: Uuid,
    pub agency_id: Uuid,
    pub respondent_name: String,
    pub respondent_email: String,
    pub respondent_whatsapp: String,
    pub total_score: i32,
    pub created_at: String,
}

// ── Agencies & membership ─────────────────────────────────────────────

/// Shown to respondents when a quiz's agency cannot be resolved.
pub const FALLBACK_AGENCY_NAME: &str = "AgencyFlow";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Manager,
    Staff,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Manager => "manager",
            Self::Staff => "staff",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Self::Owner),
            "manager" => Ok(Self::Manager),
            "staff" => Ok(Self::Staff),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    #[default]
    Free,
    Pro,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
        }
    }
}

impl FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            _ => Err(format!("Invalid plan tier: {}", s)),
        }
    }
}

/// Resources capped by the subscription plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitedFeature {
    Quizzes,
    Clients,
    Contracts,
    Users,
}

impl LimitedFeature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quizzes => "quizzes",
            Self::Clients => "clients",
            Self::Contracts => "contracts",
            Self::Users => "users",
        }
    }
}

/// Caps of one plan. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub max_quizzes: Option<u64>,
    pub max_clients: Option<u64>,
    pub max_contracts: Option<u64>,
    pub max_users: Option<u64>,
    pub watermark: bool,
}

impl PlanLimits {
    pub const FREE: PlanLimits = PlanLimits {
        max_quizzes: Some(1),
        max_clients: Some(5),
        max_contracts: Some(5),
        max_users: Some(2),
        watermark: true,
    };

    pub const PRO: PlanLimits = PlanLimits {
        max_quizzes: None,
        max_clients: None,
        max_contracts: None,
        max_users: Some(10),
        watermark: false,
    };

    pub fn for_tier(tier: PlanTier) -> Self {
        match tier {
            PlanTier::Free => Self::FREE,
            PlanTier::Pro => Self::PRO,
        }
    }

    pub fn limit(&self, feature: LimitedFeature) -> Option<u64> {
        match feature {
            LimitedFeature::Quizzes => self.max_quizzes,
            LimitedFeature::Clients => self.max_clients,
            LimitedFeature::Contracts => self.max_contracts,
            LimitedFeature::Users => self.max_users,
        }
    }

    /// Whether `count` existing items already use up the allowance.
    pub fn is_at_limit(&self, feature: LimitedFeature, count: u64) -> bool {
        self.limit(feature).is_some_and(|max| count >= max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agency {
    pub id: Uuid,
    pub name: String,
    pub subscription_tier: PlanTier,
    pub subscription_status: String,
    pub payment_customer_id: Option<String>,
    pub created_at: String,
}

impl Agency {
    pub fn is_pro_active(&self) -> bool {
        self.subscription_tier == PlanTier::Pro && self.subscription_status == "active"
    }

    pub fn limits(&self) -> PlanLimits {
        PlanLimits::for_tier(self.subscription_tier)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    pub agency_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    pub email: Option<String>,
}

/// The caller's own membership: which agency, in which role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub member_id: Uuid,
    pub agency_id: Uuid,
    pub role: Role,
}

impl From<&Member> for Membership {
    fn from(m: &Member) -> Self {
        Self {
            member_id: m.id,
            agency_id: m.agency_id,
            role: m.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invitation {
    pub token: Uuid,
    pub agency_id: Uuid,
    pub email: String,
    pub role: Role,
    pub created_by: Uuid,
    pub created_at: String,
    pub accepted_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvitationDetails {
    pub agency_name: String,
    pub email: String,
    pub role: Role,
    pub accepted: bool,
}

// ── Notifications ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    LeadNew,
    DealUpdate,
    System,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeadNew => "lead_new",
            Self::DealUpdate => "deal_update",
            Self::System => "system",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lead_new" => Ok(Self::LeadNew),
            "deal_update" => Ok(Self::DealUpdate),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid notification kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub agency_id: Uuid,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub read: bool,
    pub created_at: String,
}

// ── Profiles & identity ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThemeMode {
    Light,
    #[default]
    Dark,
}

impl ThemeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Dark => "dark",
        }
    }
}

impl FromStr for ThemeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "light" => Ok(Self::Light),
            "dark" => Ok(Self::Dark),
            _ => Err(format!("Invalid theme mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThemeStyle {
    #[default]
    Retro,
    Minimalist,
}

impl ThemeStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retro => "retro",
            Self::Minimalist => "minimalist",
        }
    }
}

impl FromStr for ThemeStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retro" => Ok(Self::Retro),
            "minimalist" => Ok(Self::Minimalist),
            _ => Err(format!("Invalid theme style: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub theme_mode: ThemeMode,
    pub theme_style: ThemeStyle,
    pub avatar_url: Option<String>,
    pub updated_at: Option<String>,
}

/// An authenticated caller as resolved from a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: Uuid,
    pub email: String,
}
