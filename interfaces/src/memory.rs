use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::defs::{
    codes, Account, AccountId, AccountKey, ActionKind, Concern, Item, ItemId, Page, Relationship,
    RemoteClient, RemoteError, RemoteResult, StreamEvent, StreamFilter, Subscription,
};

fn default_page_size() -> usize {
    200
}

/// A serializable picture of the remote service, used for dry runs and tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub me: Account,
    #[serde(default)]
    pub accounts: Vec<Account>,
    /// Directed edges `(a, b)` meaning `a` follows `b`, in the order the
    /// service lists them.
    #[serde(default)]
    pub follows: Vec<(AccountId, AccountId)>,
    /// Recent items per author, newest first.
    #[serde(default)]
    pub items: HashMap<AccountId, Vec<Item>>,
    #[serde(default)]
    pub streams: Vec<ScriptedStream>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedStream {
    pub concern: Concern,
    /// One entry per connection attempt, consumed in order.
    pub sessions: Vec<ScriptedSession>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptedSession {
    #[serde(default)]
    pub events: Vec<ScriptedEvent>,
    /// Keep the connection open after the last event until cancelled.
    #[serde(default)]
    pub hold_open: bool,
}

impl ScriptedSession {
    pub fn new(events: Vec<StreamEvent>) -> Self {
        Self {
            events: events
                .into_iter()
                .map(|event| ScriptedEvent { delay_ms: 0, event })
                .collect(),
            hold_open: false,
        }
    }

    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedEvent {
    #[serde(default)]
    pub delay_ms: u64,
    pub event: StreamEvent,
}

/// What a recorded remote call was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Me,
    Subscribe(Concern),
    Action(ActionKind, u64),
    ListFollowers(AccountId, Option<u64>),
    ListFollowing(AccountId, Option<u64>),
    GetAccount(AccountKey),
    RecentItems(AccountId),
    Relationship(AccountId, AccountId),
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub op: Op,
    pub at: Instant,
}

#[derive(Default)]
struct State {
    me: Account,
    accounts: HashMap<AccountId, Account>,
    follows: Vec<(AccountId, AccountId)>,
    items: HashMap<AccountId, Vec<Item>>,
    retweeted: HashSet<ItemId>,
    favorited: HashSet<ItemId>,
    sessions: HashMap<Concern, VecDeque<ScriptedSession>>,
    failures: HashMap<(ActionKind, u64), VecDeque<RemoteError>>,
    subscribe_failures: HashMap<Concern, VecDeque<RemoteError>>,
    broken_pages: HashSet<(AccountId, u64)>,
    broken_lookups: HashSet<AccountId>,
    latency: HashMap<u64, Duration>,
    calls: Vec<CallRecord>,
}

impl State {
    fn record(&mut self, op: Op) {
        self.calls.push(CallRecord {
            op,
            at: Instant::now(),
        });
    }

    fn is_following(&self, a: AccountId, b: AccountId) -> bool {
        self.follows.contains(&(a, b))
    }

    fn view(&self, account: &Account) -> Account {
        let me = self.me.id;
        Account {
            following: self.is_following(me, account.id),
            followed_by: self.is_following(account.id, me),
            ..account.clone()
        }
    }

    fn account(&self, id: AccountId) -> Option<Account> {
        if id == self.me.id {
            return Some(self.me.clone());
        }
        self.accounts.get(&id).map(|account| self.view(account))
    }

    fn find_item(&self, id: ItemId) -> Option<&Item> {
        self.items.values().flatten().find(|item| item.id == id)
    }

    fn page(
        &self,
        of: AccountId,
        ids: Vec<AccountId>,
        cursor: Option<u64>,
        page_size: usize,
    ) -> RemoteResult<Page<Account>> {
        if self.broken_pages.contains(&(of, cursor.unwrap_or(0))) {
            return Err(RemoteError::Unstructured(format!(
                "page {} of {} timed out",
                cursor.unwrap_or(0),
                of
            )));
        }
        let start = cursor.unwrap_or(0) as usize;
        let end = (start + page_size).min(ids.len());
        let items = ids
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.account(*id))
            .collect();
        let next_cursor = if end < ids.len() { Some(end as u64) } else { None };
        Ok(Page { items, next_cursor })
    }
}

/// In-memory implementation of [`RemoteClient`] backed by a [`Snapshot`].
///
/// Every call is recorded with the (tokio) instant it was made, and failures
/// can be scripted per action target, which makes it suitable for exercising
/// pacing and error handling under a paused clock.
pub struct MemoryClient {
    state: Mutex<State>,
    page_size: usize,
}

impl MemoryClient {
    pub fn new(me: Account) -> Self {
        Self::from_snapshot(Snapshot {
            me,
            page_size: default_page_size(),
            ..Default::default()
        })
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut sessions: HashMap<Concern, VecDeque<ScriptedSession>> = HashMap::new();
        for stream in snapshot.streams {
            sessions.entry(stream.concern).or_default().extend(stream.sessions);
        }

        let state = State {
            me: snapshot.me,
            accounts: snapshot.accounts.into_iter().map(|a| (a.id, a)).collect(),
            follows: snapshot.follows,
            items: snapshot.items,
            sessions,
            ..Default::default()
        };

        Self {
            state: Mutex::new(state),
            page_size: snapshot.page_size.max(1),
        }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let snapshot: Snapshot = serde_json::from_str(json)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_account(mut self, account: Account) -> Self {
        self.state.get_mut().accounts.insert(account.id, account);
        self
    }

    pub fn with_follow(mut self, a: AccountId, b: AccountId) -> Self {
        let state = self.state.get_mut();
        if !state.is_following(a, b) {
            state.follows.push((a, b));
        }
        self
    }

    pub fn with_items(mut self, author: AccountId, items: Vec<Item>) -> Self {
        self.state.get_mut().items.insert(author, items);
        self
    }

    pub fn with_session(mut self, concern: Concern, session: ScriptedSession) -> Self {
        self.state
            .get_mut()
            .sessions
            .entry(concern)
            .or_default()
            .push_back(session);
        self
    }

    /// Queue an error to be returned by the next `call(kind, target)`.
    pub async fn fail_next(&self, kind: ActionKind, target: u64, error: RemoteError) {
        let mut state = self.state.lock().await;
        state.failures.entry((kind, target)).or_default().push_back(error);
    }

    /// Queue an error to be returned by the next `subscribe` for `concern`.
    /// The scripted session stays queued for the attempt after it.
    pub async fn fail_next_subscribe(&self, concern: Concern, error: RemoteError) {
        let mut state = self.state.lock().await;
        state.subscribe_failures.entry(concern).or_default().push_back(error);
    }

    /// Make the follower and following pages of `of` that start at `cursor`
    /// fail.
    pub async fn break_page(&self, of: AccountId, cursor: u64) {
        self.state.lock().await.broken_pages.insert((of, cursor));
    }

    /// Make account lookups and item fetches for `id` fail.
    pub async fn break_lookup(&self, id: AccountId) {
        self.state.lock().await.broken_lookups.insert(id);
    }

    /// Delay every action against `target` by `latency`.
    pub async fn set_latency(&self, target: u64, latency: Duration) {
        self.state.lock().await.latency.insert(target, latency);
    }

    pub async fn set_followers_count(&self, id: AccountId, count: u64) {
        let mut state = self.state.lock().await;
        if state.me.id == id {
            state.me.followers_count = count;
        } else if let Some(account) = state.accounts.get_mut(&id) {
            account.followers_count = count;
        }
    }

    pub async fn calls(&self) -> Vec<CallRecord> {
        self.state.lock().await.calls.clone()
    }

    /// Every action call made so far, in order, including failed ones.
    pub async fn actions(&self) -> Vec<(ActionKind, u64)> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|record| match record.op {
                Op::Action(kind, target) => Some((kind, target)),
                _ => None,
            })
            .collect()
    }

    pub async fn is_following(&self, a: AccountId, b: AccountId) -> bool {
        self.state.lock().await.is_following(a, b)
    }

    async fn apply(&self, kind: ActionKind, target: u64) -> RemoteResult<()> {
        let mut state = self.state.lock().await;
        if let Some(error) = state
            .failures
            .get_mut(&(kind, target))
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }

        let me = state.me.id;
        match kind {
            ActionKind::Retweet | ActionKind::Favorite => {
                if state.find_item(target).is_none() {
                    return Err(RemoteError::Api {
                        code: codes::NO_STATUS_FOUND,
                        message: "No status found with that ID.".to_owned(),
                    });
                }
                let (done, code, message) = match kind {
                    ActionKind::Retweet => (
                        &mut state.retweeted,
                        codes::ALREADY_RETWEETED,
                        "You have already retweeted this Tweet.",
                    ),
                    _ => (
                        &mut state.favorited,
                        codes::ALREADY_FAVORITED,
                        "You have already favorited this status.",
                    ),
                };
                if !done.insert(target) {
                    return Err(RemoteError::Api {
                        code,
                        message: message.to_owned(),
                    });
                }
            }
            ActionKind::Follow => {
                if !state.accounts.contains_key(&target) {
                    return Err(RemoteError::Api {
                        code: codes::USER_NOT_FOUND,
                        message: "User not found.".to_owned(),
                    });
                }
                if state.is_following(me, target) {
                    return Err(RemoteError::Api {
                        code: codes::ALREADY_FOLLOW_REQUESTED,
                        message: "You are already following this user.".to_owned(),
                    });
                }
                state.follows.push((me, target));
            }
            ActionKind::Unfollow => {
                state.follows.retain(|edge| *edge != (me, target));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for MemoryClient {
    async fn me(&self) -> RemoteResult<Account> {
        let mut state = self.state.lock().await;
        state.record(Op::Me);
        Ok(state.me.clone())
    }

    async fn subscribe(&self, filter: &StreamFilter) -> RemoteResult<Subscription> {
        let concern = filter.concern();
        let session = {
            let mut state = self.state.lock().await;
            state.record(Op::Subscribe(concern));
            if let Some(error) = state
                .subscribe_failures
                .get_mut(&concern)
                .and_then(|queue| queue.pop_front())
            {
                return Err(error);
            }
            state.sessions.get_mut(&concern).and_then(|queue| queue.pop_front())
        };
        let session = session.ok_or_else(|| {
            RemoteError::Unstructured(format!("no {} stream available", concern))
        })?;

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let producer_cancel = cancel.clone();

        tokio::spawn(async move {
            for scripted in session.events {
                tokio::select! {
                    _ = producer_cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(scripted.delay_ms)) => {}
                }
                if tx.send(scripted.event).await.is_err() {
                    return;
                }
            }
            if session.hold_open {
                producer_cancel.cancelled().await;
            }
            debug!("{} stream script finished", concern);
        });

        Ok(Subscription::new(rx, cancel))
    }

    async fn call(&self, kind: ActionKind, target: u64) -> RemoteResult<()> {
        let latency = {
            let mut state = self.state.lock().await;
            state.record(Op::Action(kind, target));
            state.latency.get(&target).copied()
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.apply(kind, target).await
    }

    async fn list_followers(&self, of: AccountId, cursor: Option<u64>) -> RemoteResult<Page<Account>> {
        let mut state = self.state.lock().await;
        state.record(Op::ListFollowers(of, cursor));
        let ids = state
            .follows
            .iter()
            .filter(|(_, b)| *b == of)
            .map(|(a, _)| *a)
            .collect();
        state.page(of, ids, cursor, self.page_size)
    }

    async fn list_following(&self, of: AccountId, cursor: Option<u64>) -> RemoteResult<Page<Account>> {
        let mut state = self.state.lock().await;
        state.record(Op::ListFollowing(of, cursor));
        let ids = state
            .follows
            .iter()
            .filter(|(a, _)| *a == of)
            .map(|(_, b)| *b)
            .collect();
        state.page(of, ids, cursor, self.page_size)
    }

    async fn get_account(&self, key: &AccountKey) -> RemoteResult<Account> {
        let mut state = self.state.lock().await;
        state.record(Op::GetAccount(key.clone()));
        let id = match key {
            AccountKey::Id(id) => Some(*id),
            AccountKey::ScreenName(name) => std::iter::once(&state.me)
                .chain(state.accounts.values())
                .find(|account| account.screen_name.eq_ignore_ascii_case(name))
                .map(|account| account.id),
        };
        let id = id.ok_or_else(|| RemoteError::NotFound(key.to_string()))?;
        if state.broken_lookups.contains(&id) {
            return Err(RemoteError::Unstructured(format!("lookup of {} timed out", key)));
        }
        state.account(id).ok_or_else(|| RemoteError::NotFound(key.to_string()))
    }

    async fn recent_items(&self, of: AccountId, limit: usize) -> RemoteResult<Vec<Item>> {
        let mut state = self.state.lock().await;
        state.record(Op::RecentItems(of));
        if state.broken_lookups.contains(&of) {
            return Err(RemoteError::Unstructured(format!("timeline of {} timed out", of)));
        }
        let items = state.items.get(&of).cloned().unwrap_or_default();
        Ok(items
            .into_iter()
            .take(limit)
            .map(|item| Item {
                retweeted: item.retweeted || state.retweeted.contains(&item.id),
                favorited: item.favorited || state.favorited.contains(&item.id),
                author: state.account(item.author.id).unwrap_or(item.author.clone()),
                ..item
            })
            .collect())
    }

    async fn relationship(&self, a: AccountId, b: AccountId) -> RemoteResult<Relationship> {
        let mut state = self.state.lock().await;
        state.record(Op::Relationship(a, b));
        if state.broken_lookups.contains(&b) {
            return Err(RemoteError::Unstructured(format!("relationship {} -> {} timed out", a, b)));
        }
        Ok(Relationship {
            a_follows_b: state.is_following(a, b),
            b_follows_a: state.is_following(b, a),
        })
    }
}
