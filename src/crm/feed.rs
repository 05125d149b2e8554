//! Realtime change feed.
//!
//! Every committed insert, update or delete is announced on a bounded
//! broadcast channel. Subscribers that fall behind skip the missed events
//! and are expected to refetch.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Capacity of the broadcast channel backing the feed.
pub const FEED_CAPACITY: usize = 256;

/// Tables whose changes are published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Deals,
    Contacts,
    Contracts,
    Quizzes,
    QuizResponses,
    Agencies,
    AgencyUsers,
    Notifications,
    Profiles,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deals => "deals",
            Self::Contacts => "contacts",
            Self::Contracts => "contracts",
            Self::Quizzes => "quizzes",
            Self::QuizResponses => "quiz_responses",
            Self::Agencies => "agencies",
            Self::AgencyUsers => "agency_users",
            Self::Notifications => "notifications",
            Self::Profiles => "profiles",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deals" => Ok(Self::Deals),
            "contacts" => Ok(Self::Contacts),
            "contracts" => Ok(Self::Contracts),
            "quizzes" => Ok(Self::Quizzes),
            "quiz_responses" => Ok(Self::QuizResponses),
            "agencies" => Ok(Self::Agencies),
            "agency_users" => Ok(Self::AgencyUsers),
            "notifications" => Ok(Self::Notifications),
            "profiles" => Ok(Self::Profiles),
            _ => Err(format!("Invalid table: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(format!("Invalid change kind: {}", s)),
        }
    }
}

/// One committed row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    /// Tenant the row belongs to, when it has one.
    pub agency_id: Option<Uuid>,
    /// User the row belongs to (profiles).
    pub user_id: Option<Uuid>,
    pub record: serde_json::Value,
}

impl ChangeEvent {
    pub fn new<T: Serialize>(table: Table, kind: ChangeKind, agency_id: Option<Uuid>, record: &T) -> Self {
        Self {
            table,
            kind,
            agency_id,
            user_id: None,
            record: serde_json::to_value(record).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn for_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

/// What a subscriber wants to hear about. `None` fields match anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    #[serde(default)]
    pub event: Option<ChangeKind>,
    pub table: Table,
    #[serde(default)]
    pub agency_id: Option<Uuid>,
}

impl ChangeFilter {
    pub fn table(table: Table) -> Self {
        Self {
            event: None,
            table,
            agency_id: None,
        }
    }

    pub fn event(mut self, kind: ChangeKind) -> Self {
        self.event = Some(kind);
        self
    }

    pub fn agency(mut self, agency_id: Uuid) -> Self {
        self.agency_id = Some(agency_id);
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table {
            return false;
        }
        if self.event.is_some_and(|k| k != event.kind) {
            return false;
        }
        match self.agency_id {
            Some(agency) => event.agency_id == Some(agency),
            None => true,
        }
    }
}

/// Visibility of feed events for one caller: rows of their agency and rows
/// that belong to them personally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scope {
    pub agency_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
}

impl Scope {
    pub fn allows(&self, event: &ChangeEvent) -> bool {
        let agency_ok = self.agency_id.is_some() && event.agency_id == self.agency_id;
        let user_ok = self.user_id.is_some() && event.user_id == self.user_id;
        agency_ok || user_ok
    }
}

/// Cheap-to-clone publisher for row changes.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Returns silently when nobody is listening.
    pub fn publish(&self, event: ChangeEvent) {
        tracing::trace!(table = %event.table, kind = event.kind.as_str(), "change published");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
