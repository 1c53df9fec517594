use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

pub type ItemId = u64;
pub type AccountId = u64;

/// Error codes the remote service attaches to rejected actions.
pub mod codes {
    pub const USER_NOT_FOUND: u32 = 50;
    pub const ALREADY_FAVORITED: u32 = 139;
    pub const NO_STATUS_FOUND: u32 = 144;
    pub const ALREADY_FOLLOW_REQUESTED: u32 = 160;
    pub const FOLLOW_LIMIT_REACHED: u32 = 161;
    pub const ALREADY_RETWEETED: u32 = 327;
}

/// A profile in the remote social graph. `following` and `followed_by` are
/// relative to the authenticated agent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    #[serde(default)]
    pub screen_name: String,
    #[serde(default)]
    pub followers_count: u64,
    #[serde(default, alias = "following_count")]
    pub friends_count: u64,
    #[serde(default)]
    pub following: bool,
    #[serde(default)]
    pub followed_by: bool,
    #[serde(default)]
    pub location: Option<String>,
}

impl Account {
    pub fn new(id: AccountId, screen_name: &str) -> Self {
        Self {
            id,
            screen_name: screen_name.to_owned(),
            ..Default::default()
        }
    }

    pub fn with_counts(mut self, followers_count: u64, friends_count: u64) -> Self {
        self.followers_count = followers_count;
        self.friends_count = friends_count;
        self
    }
}

/// An engageable status. Never mutated once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    #[serde(rename = "user")]
    pub author: Account,
    #[serde(alias = "full_text")]
    pub text: String,
    #[serde(default)]
    pub retweeted: bool,
    #[serde(default)]
    pub favorited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub possibly_sensitive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retweeted_status: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to_user_id: Option<AccountId>,
    #[serde(default)]
    pub retweet_count: u64,
    #[serde(default)]
    pub favorite_count: u64,
}

impl Item {
    pub fn new(id: ItemId, author: Account, text: &str) -> Self {
        Self {
            id,
            author,
            text: text.to_owned(),
            retweeted: false,
            favorited: false,
            possibly_sensitive: None,
            retweeted_status: None,
            in_reply_to_user_id: None,
            retweet_count: 0,
            favorite_count: 0,
        }
    }

    pub fn is_sensitive(&self) -> bool {
        self.possibly_sensitive.unwrap_or(false)
    }

    pub fn is_reply(&self) -> bool {
        self.in_reply_to_user_id.is_some()
    }

    pub fn is_retweet(&self) -> bool {
        self.retweeted_status.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Relationship {
    pub a_follows_b: bool,
    pub b_follows_a: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Retweet,
    Favorite,
    Follow,
    Unfollow,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Retweet => "retweet",
            Self::Favorite => "favorite",
            Self::Follow => "follow",
            Self::Unfollow => "unfollow",
        };
        f.write_str(name)
    }
}

/// Identifies an account either by numeric id or by screen name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AccountKey {
    Id(AccountId),
    ScreenName(String),
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{}", id),
            Self::ScreenName(name) => write!(f, "@{}", name),
        }
    }
}

/// One page of a cursored collection. `next_cursor` is `None` on the last page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<u64>,
}

/// Which of the two live concerns a subscription serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Concern {
    Track,
    Follow,
}

impl fmt::Display for Concern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Track => f.write_str("track"),
            Self::Follow => f.write_str("follow"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamFilter {
    #[serde(default)]
    pub track: Vec<String>,
    #[serde(default)]
    pub follow: Vec<AccountId>,
}

impl StreamFilter {
    pub fn track(keywords: Vec<String>) -> Self {
        Self {
            track: keywords,
            follow: Vec::new(),
        }
    }

    pub fn follow(ids: Vec<AccountId>) -> Self {
        Self {
            track: Vec::new(),
            follow: ids,
        }
    }

    pub fn concern(&self) -> Concern {
        if self.track.is_empty() {
            Concern::Follow
        } else {
            Concern::Track
        }
    }
}

/// Raw delivery from a live subscription. Payloads are left unparsed so the
/// consumer decides what counts as malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Connected,
    Payload(String),
    Disconnected { status: Option<u16>, reason: String },
    Error(String),
}

/// A live, cancellable sequence of stream events. Dropping it cancels the
/// producer.
pub struct Subscription {
    events: ReceiverStream<StreamEvent>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<StreamEvent>, cancel: CancellationToken) -> Self {
        Self {
            events: ReceiverStream::new(events),
            cancel,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for Subscription {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote error {code}: {message}")]
    Api { code: u32, message: String },

    #[error("remote call failed: {0}")]
    Unstructured(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    pub fn code(&self) -> Option<u32> {
        match self {
            Self::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// The remote service as seen by the engagement engine. Implementations must
/// be safe to share across concurrently running tasks.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// The authenticated agent's own account.
    async fn me(&self) -> RemoteResult<Account>;

    /// Open a live subscription for either tracked keywords or followed ids.
    async fn subscribe(&self, filter: &StreamFilter) -> RemoteResult<Subscription>;

    /// Perform one mutating action against an item (retweet, favorite) or an
    /// account (follow, unfollow).
    async fn call(&self, kind: ActionKind, target: u64) -> RemoteResult<()>;

    async fn list_followers(&self, of: AccountId, cursor: Option<u64>) -> RemoteResult<Page<Account>>;

    async fn list_following(&self, of: AccountId, cursor: Option<u64>) -> RemoteResult<Page<Account>>;

    async fn get_account(&self, key: &AccountKey) -> RemoteResult<Account>;

    /// Most recent items authored by an account, newest first.
    async fn recent_items(&self, of: AccountId, limit: usize) -> RemoteResult<Vec<Item>>;

    async fn relationship(&self, a: AccountId, b: AccountId) -> RemoteResult<Relationship>;
}
