use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{AccountId, AccountKey, EngineError, Result};

/// Everything the engine needs to run, loaded from a JSON document. Every
/// field has a default so a partial file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Keywords for the track subscription.
    pub track: Vec<String>,
    /// Account ids for the follow subscription.
    pub follow_ids: Vec<AccountId>,
    pub rule: FilterRule,
    pub dispatch: DispatchConfig,
    pub crawl: CrawlConfig,
    pub stream: StreamConfig,
    /// Accounts the unfollow sweep never removes.
    pub allow_list: Vec<AccountId>,
}

impl AgentConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&raw)?;
        debug!("Loaded configuration from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.crawl.batch_size == 0 {
            return Err(EngineError::Config("crawl.batch_size must be at least 1".to_string()));
        }
        if let Some(jitter) = &self.dispatch.jitter {
            if jitter.floor_min_secs > jitter.floor_max_secs {
                return Err(EngineError::Config(format!(
                    "dispatch.jitter floor window is inverted: {} > {}",
                    jitter.floor_min_secs, jitter.floor_max_secs
                )));
            }
            if jitter.floor_max_secs > jitter.ceiling_secs {
                return Err(EngineError::Config(format!(
                    "dispatch.jitter ceiling {} is below the floor window",
                    jitter.ceiling_secs
                )));
            }
        }
        if self.stream.initial_backoff_secs > self.stream.max_backoff_secs {
            return Err(EngineError::Config(
                "stream.initial_backoff_secs exceeds stream.max_backoff_secs".to_string(),
            ));
        }
        Ok(())
    }
}

/// Look/block terms and the numeric thresholds that gate reactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRule {
    /// At least one must appear as a token of the item text.
    pub look: Vec<String>,
    /// Any token match vetoes the item.
    pub block: Vec<String>,
    /// Minimum author follower count to react to or follow an account.
    pub min_followers: u64,
    /// Followers plus this margin must exceed the following count.
    pub follower_margin: u64,
    /// Minimum retweets by others before the agent retweets.
    pub min_retweets: u64,
}

impl Default for FilterRule {
    fn default() -> Self {
        Self {
            look: Vec::new(),
            block: Vec::new(),
            min_followers: 100,
            follower_margin: 300,
            min_retweets: 0,
        }
    }
}

/// Randomized pre-action wait. The lower bound is itself drawn from
/// `floor_min_secs..=floor_max_secs`, the upper bound is `ceiling_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterWindow {
    pub floor_min_secs: u64,
    pub floor_max_secs: u64,
    pub ceiling_secs: u64,
}

impl Default for JitterWindow {
    fn default() -> Self {
        Self {
            floor_min_secs: 1,
            floor_max_secs: 10,
            ceiling_secs: 180,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// `None` disables the pre-action wait.
    pub jitter: Option<JitterWindow>,
    pub cooldown_minutes: u64,
    /// Remote error codes meaning "this action was already applied".
    pub duplicate_codes: Vec<u32>,
}

impl DispatchConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_minutes.saturating_mul(60))
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        use interfaces::codes;
        Self {
            jitter: Some(JitterWindow::default()),
            cooldown_minutes: 15,
            duplicate_codes: vec![
                codes::ALREADY_RETWEETED,
                codes::ALREADY_FAVORITED,
                codes::ALREADY_FOLLOW_REQUESTED,
            ],
        }
    }
}

/// Where a crawl pass takes its entries from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlSource {
    /// The agent's own followers; eligible for the unchanged-count shortcut.
    #[default]
    MyFollowers,
    FollowersOf(AccountKey),
    WatchList(Vec<AccountKey>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub source: CrawlSource,
    /// Entries processed between pauses.
    pub batch_size: usize,
    pub pause_minutes: u64,
    /// How many of an entry's latest items go through the filter.
    pub recent_items: usize,
    /// Wait between passes of the outer loop.
    pub interval_hours: u64,
}

impl CrawlConfig {
    pub fn pause(&self) -> Duration {
        Duration::from_secs(self.pause_minutes.saturating_mul(60))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours.saturating_mul(3600))
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            source: CrawlSource::MyFollowers,
            batch_size: 10,
            pause_minutes: 15,
            recent_items: 3,
            interval_hours: 4,
        }
    }
}

/// Restart policy for live subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub restart: bool,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// Minimum wait after a 420-style stop before reconnecting.
    pub enhance_calm_secs: u64,
    /// `None` restarts forever.
    pub max_restarts: Option<u32>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            restart: true,
            initial_backoff_secs: 5,
            max_backoff_secs: 320,
            enhance_calm_secs: 60,
            max_restarts: None,
        }
    }
}
