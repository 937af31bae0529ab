//! Core domain types for otagon
//!
//! These types describe the state the gaming companion keeps per player:
//! who they are and what they pay for, how much of their monthly quota is
//! used, and the conversations (tabs) their chat history is split into.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **User** | A player with an account; owns conversations and a quota |
//! | **Tier** | Subscription level (free, pro, vanguard) controlling query quotas |
//! | **Conversation** | A named thread of messages; also called a tab in the UI |
//! | **General conversation** | The "Everything Else" tab every user has |
//! | **Game conversation** | A tab dedicated to one detected game |
//! | **Insight** | An AI-generated sub-tab attached to a conversation |
//! | **Quota window** | `(count, limit, last_reset_at)` per query kind |
//! | **Migration** | Moving messages from one conversation to another |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================
// Tiers and quotas
// ============================================

/// Subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Vanguard,
}

impl Tier {
    /// Returns the identifier used in database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Vanguard => "vanguard",
        }
    }

    /// Returns the display name for this tier
    pub fn display_name(&self) -> &'static str {
        match self {
            Tier::Free => "Free",
            Tier::Pro => "Pro",
            Tier::Vanguard => "Vanguard",
        }
    }

    /// Whether this tier is a paid tier
    pub fn is_paid(&self) -> bool {
        !matches!(self, Tier::Free)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "vanguard" => Ok(Tier::Vanguard),
            _ => Err(format!("unknown tier: {}", s)),
        }
    }
}

/// Monthly query limits for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Text queries per month
    pub text: u32,
    /// Image queries per month
    pub image: u32,
}

impl TierLimits {
    pub const FREE: TierLimits = TierLimits {
        text: 55,
        image: 25,
    };
    pub const PRO: TierLimits = TierLimits {
        text: 1583,
        image: 328,
    };
    pub const VANGUARD: TierLimits = TierLimits {
        text: 1583,
        image: 328,
    };

    /// Built-in limits for a tier
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Free => Self::FREE,
            Tier::Pro => Self::PRO,
            Tier::Vanguard => Self::VANGUARD,
        }
    }
}

/// Kind of query counted against the quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Text,
    Image,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Text => "text",
            QueryKind::Image => "image",
        }
    }
}

impl std::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QueryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(QueryKind::Text),
            "image" => Ok(QueryKind::Image),
            _ => Err(format!("unknown query kind: {}", s)),
        }
    }
}

/// Outcome of a quota check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDecision {
    /// Which quota window was checked
    pub kind: QueryKind,
    /// Whether one more query fits in the window
    pub allowed: bool,
    /// Why the query was denied (only set when denied)
    pub reason: Option<String>,
    /// Queries used in the current window
    pub used: u32,
    /// Window limit
    pub limit: u32,
}

/// One quota window as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaWindow {
    pub used: u32,
    pub limit: u32,
}

impl QuotaWindow {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }
}

/// Usage snapshot for a user
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub user_id: String,
    pub tier: Tier,
    pub is_on_trial: bool,
    pub text: QuotaWindow,
    pub image: QuotaWindow,
    pub last_reset_at: DateTime<Utc>,
    /// First instant of the next UTC month
    pub next_reset_at: DateTime<Utc>,
}

// ============================================
// Users
// ============================================

/// A player account with its tier, usage counters and trial state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Internal identifier
    pub id: String,
    /// Identity from the external auth provider
    pub auth_user_id: String,
    pub email: String,
    pub tier: Tier,
    pub text_count: u32,
    pub image_count: u32,
    pub text_limit: u32,
    pub image_limit: u32,
    /// When the usage counters were last zeroed
    pub last_reset_at: DateTime<Utc>,
    pub is_on_trial: bool,
    pub has_used_trial: bool,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub trial_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Create a new user on the given tier with zeroed counters
    pub fn new(
        auth_user_id: impl Into<String>,
        email: impl Into<String>,
        tier: Tier,
        limits: TierLimits,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            auth_user_id: auth_user_id.into(),
            email: email.into(),
            tier,
            text_count: 0,
            image_count: 0,
            text_limit: limits.text,
            image_limit: limits.image,
            last_reset_at: now,
            is_on_trial: false,
            has_used_trial: false,
            trial_started_at: None,
            trial_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Queries used in the window for `kind`
    pub fn count(&self, kind: QueryKind) -> u32 {
        match kind {
            QueryKind::Text => self.text_count,
            QueryKind::Image => self.image_count,
        }
    }

    /// Limit of the window for `kind`
    pub fn limit(&self, kind: QueryKind) -> u32 {
        match kind {
            QueryKind::Text => self.text_limit,
            QueryKind::Image => self.image_limit,
        }
    }

    pub(crate) fn count_mut(&mut self, kind: QueryKind) -> &mut u32 {
        match kind {
            QueryKind::Text => &mut self.text_count,
            QueryKind::Image => &mut self.image_count,
        }
    }

    /// Switch tier and adopt its limits
    pub fn apply_tier(&mut self, tier: Tier, limits: TierLimits) {
        self.tier = tier;
        self.text_limit = limits.text;
        self.image_limit = limits.image;
    }
}

// ============================================
// Conversations
// ============================================

/// Id of the general conversation every user has
pub const GENERAL_CONVERSATION_ID: &str = "everything-else";

/// Title of the general conversation
pub const GENERAL_CONVERSATION_TITLE: &str = "Everything Else";

/// Derive the conversation id for a game title.
///
/// `"The Legend of Zelda: Tears of the Kingdom"` becomes
/// `"game-the-legend-of-zelda-tears-of-the-kingdom"`.
pub fn game_conversation_id(game_title: &str) -> String {
    let mut slug = String::with_capacity(game_title.len());
    for c in game_title.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    format!("game-{}", slug)
}

/// Who wrote a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            _ => Err(format!("unknown message role: {}", s)),
        }
    }
}

/// A chat message. Content never changes; migration only changes the owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    /// Reference to an uploaded screenshot
    pub image_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a message with a fresh id
    pub fn new(role: MessageRole, content: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            image_ref: None,
            created_at: now,
        }
    }

    pub fn with_image(mut self, image_ref: impl Into<String>) -> Self {
        self.image_ref = Some(image_ref.into());
        self
    }
}

/// Loading state of an insight sub-tab
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightStatus {
    Pending,
    Loaded,
    Error,
}

impl InsightStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightStatus::Pending => "pending",
            InsightStatus::Loaded => "loaded",
            InsightStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for InsightStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InsightStatus::Pending),
            "loaded" => Ok(InsightStatus::Loaded),
            "error" => Ok(InsightStatus::Error),
            _ => Err(format!("unknown insight status: {}", s)),
        }
    }
}

/// An AI-generated sub-tab attached to a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub title: String,
    pub content: String,
    pub status: InsightStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A conversation with its messages and insights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    /// Game this tab is dedicated to, if any
    pub game_title: Option<String>,
    pub is_pinned: bool,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every write; used for optimistic concurrency
    pub version: i64,
    /// Messages in chronological order
    pub messages: Vec<Message>,
    /// Insight sub-tabs keyed by insight id
    pub insights: BTreeMap<String, Insight>,
}

impl Conversation {
    /// Create an empty conversation at version 1
    pub fn new(
        user_id: impl Into<String>,
        id: impl Into<String>,
        title: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            title: title.into(),
            game_title: None,
            is_pinned: false,
            is_archived: false,
            created_at: now,
            updated_at: now,
            version: 1,
            messages: Vec::new(),
            insights: BTreeMap::new(),
        }
    }

    pub fn is_general(&self) -> bool {
        self.id == GENERAL_CONVERSATION_ID
    }

    pub fn contains_message(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }
}

/// Lightweight conversation row for list views
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub game_title: Option<String>,
    pub is_pinned: bool,
    pub is_archived: bool,
    pub updated_at: DateTime<Utc>,
    pub message_count: i64,
    pub insight_count: i64,
}

/// Result of moving messages between conversations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Ids now owned by the destination that came from the source
    pub moved: Vec<String>,
    /// Ids the destination already held; the source copy was dropped
    pub deduplicated: Vec<String>,
    /// Ids the source did not contain
    pub missing: Vec<String>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.moved.is_empty() && self.deduplicated.is_empty()
    }
}

// ============================================
// Trials
// ============================================

/// Result of the session-start trial check
#[derive(Debug, Clone, PartialEq)]
pub enum TrialCheck {
    /// User was never on a trial, or is on a paid tier without one
    NotOnTrial { user: User },
    /// Trial running with more than the warning window left
    Active {
        user: User,
        expires_at: DateTime<Utc>,
    },
    /// Trial ends within the warning window
    ExpiringSoon { user: User, hours_left: i64 },
    /// Trial had ended; user was downgraded to free
    Expired { user: User },
}

impl TrialCheck {
    /// The user record after the check
    pub fn user(&self) -> &User {
        match self {
            TrialCheck::NotOnTrial { user }
            | TrialCheck::Active { user, .. }
            | TrialCheck::ExpiringSoon { user, .. }
            | TrialCheck::Expired { user } => user,
        }
    }
}
