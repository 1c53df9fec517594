use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use interfaces::defs::{
    Account, AccountId, AccountKey, ActionKind, Concern, Item, ItemId, Relationship, RemoteClient,
    RemoteError, StreamEvent, StreamFilter,
};

/// Result of attempting one action against the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Succeeded,
    /// The remote side reported the action as already applied.
    AlreadyDone,
    /// An uncoded failure; the dispatcher has already sat out the cool-down.
    RateLimited,
    Failed,
}

impl ActionOutcome {
    /// True when the target is now in the desired state.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Succeeded | Self::AlreadyDone)
    }
}

/// Summary of one batch-crawl pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlReport {
    /// Follower count of the crawled account, or entries processed for a
    /// watch list. Fed back into the next pass as the short-circuit threshold.
    pub follower_count: u64,
    pub processed: usize,
    pub followed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub reactions: usize,
    pub short_circuited: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CrawlReport {
    pub(crate) fn started(follower_count: u64) -> Self {
        let now = Utc::now();
        Self {
            follower_count,
            processed: 0,
            followed: 0,
            skipped: 0,
            failed: 0,
            reactions: 0,
            short_circuited: false,
            cancelled: false,
            started_at: now,
            finished_at: now,
        }
    }

    pub(crate) fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }
}

/// Summary of one unfollow sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub checked: usize,
    pub unfollowed: Vec<AccountId>,
    pub kept_mutual: usize,
    pub kept_allowed: usize,
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
