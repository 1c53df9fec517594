use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{FilterRule, StreamConfig};
use crate::dispatcher::Dispatcher;
use crate::filter::{self, Decision};
use crate::types::{
    ActionKind, ActionOutcome, Concern, EngineError, Item, RemoteClient, Result, StreamEvent,
    StreamFilter,
};
use interfaces::Subscription;

/// HTTP-style status the service uses to tell a client to back off.
pub const ENHANCE_YOUR_CALM: u16 = 420;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Connecting,
    Streaming,
    Disconnected,
    ErrorTerminated,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Stop,
}

/// How one connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Disconnected,
    /// Ended by an error or a stop request; `calm` is set for a 420-style stop.
    ErrorTerminated { calm: bool },
    Cancelled,
}

impl SessionEnd {
    fn state(&self) -> SubscriptionState {
        match self {
            Self::Disconnected => SubscriptionState::Disconnected,
            Self::ErrorTerminated { .. } => SubscriptionState::ErrorTerminated,
            Self::Cancelled => SubscriptionState::Cancelled,
        }
    }
}

/// Receives what a live subscription delivers.
pub trait StreamListener: Send + Sync {
    /// Must return promptly; long work belongs on its own task.
    fn on_item(&self, concern: Concern, item: Item);

    fn on_disconnect(&self, concern: Concern, status: Option<u16>, reason: &str);

    fn on_error(&self, concern: Concern, error: &str) -> Control;
}

#[derive(Debug, Deserialize)]
struct DisconnectNotice {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StreamMessage {
    Disconnect { disconnect: DisconnectNotice },
    Limit { limit: serde_json::Value },
    Delete { delete: serde_json::Value },
    Status(Box<Item>),
}

/// Pump one connected subscription into `listener` until it ends.
pub async fn drive<L>(
    listener: &L,
    concern: Concern,
    mut subscription: Subscription,
    cancel: &CancellationToken,
) -> SessionEnd
where
    L: StreamListener + ?Sized,
{
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                subscription.cancel();
                return SessionEnd::Cancelled;
            }
            event = subscription.next() => event,
        };

        match event {
            None => {
                listener.on_disconnect(concern, None, "stream closed by remote");
                return SessionEnd::Disconnected;
            }
            Some(StreamEvent::Connected) => {
                debug!("{} stream acknowledged connection", concern);
            }
            Some(StreamEvent::Payload(raw)) => {
                let value: serde_json::Value = match serde_json::from_str(&raw) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!("Dropping malformed {} payload: {}", concern, e);
                        continue;
                    }
                };
                match serde_json::from_value::<StreamMessage>(value) {
                    Ok(StreamMessage::Status(item)) => listener.on_item(concern, *item),
                    Ok(StreamMessage::Disconnect { disconnect }) => {
                        listener.on_disconnect(concern, disconnect.code, &disconnect.reason);
                        return SessionEnd::Disconnected;
                    }
                    Ok(StreamMessage::Limit { limit }) => {
                        warn!("{} stream limit notice: {}", concern, limit);
                    }
                    Ok(StreamMessage::Delete { .. }) => {
                        debug!("{} stream delete notice ignored", concern);
                    }
                    Err(_) => {
                        warn!("Dropping unrecognized {} payload: {}", concern, raw);
                    }
                }
            }
            Some(StreamEvent::Disconnected { status, reason }) => {
                listener.on_disconnect(concern, status, &reason);
                if status == Some(ENHANCE_YOUR_CALM) {
                    return SessionEnd::ErrorTerminated { calm: true };
                }
                return SessionEnd::Disconnected;
            }
            Some(StreamEvent::Error(message)) => {
                if listener.on_error(concern, &message) == Control::Stop {
                    return SessionEnd::ErrorTerminated { calm: false };
                }
            }
        }
    }
}

/// Filter, then retweet/favorite, one item.
pub async fn engage(dispatcher: &Dispatcher, rule: &FilterRule, item: &Item) -> Vec<(ActionKind, ActionOutcome)> {
    if let Decision::Reject(reason) = filter::decide(item, rule) {
        debug!("Rejected item {} from @{}: {}", item.id, item.author.screen_name, reason);
        return Vec::new();
    }
    let reactions = filter::reactions(item, rule);
    if !reactions.any() {
        debug!(
            "Accepted item {} from @{} but no reaction qualifies",
            item.id, item.author.screen_name
        );
        return Vec::new();
    }
    info!("Accepted item {} from @{}", item.id, item.author.screen_name);
    dispatcher.react(item, reactions).await
}

/// Routes live items through the filter and dispatcher, one task per item.
pub struct StreamProcessor {
    client: Arc<dyn RemoteClient>,
    dispatcher: Arc<Dispatcher>,
    rule: Arc<FilterRule>,
    config: StreamConfig,
    tracker: TaskTracker,
}

impl StreamListener for StreamProcessor {
    fn on_item(&self, concern: Concern, item: Item) {
        debug!("{} stream delivered item {}", concern, item.id);
        let dispatcher = self.dispatcher.clone();
        let rule = self.rule.clone();
        self.tracker.spawn(async move {
            let outcomes = engage(&dispatcher, &rule, &item).await;
            for (kind, outcome) in outcomes {
                debug!("Item {} {}: {:?}", item.id, kind, outcome);
            }
        });
    }

    fn on_disconnect(&self, concern: Concern, status: Option<u16>, reason: &str) {
        match status {
            Some(ENHANCE_YOUR_CALM) => warn!("{} stream told to back off (420): {}", concern, reason),
            Some(code) => warn!("{} stream disconnected ({}): {}", concern, code, reason),
            None => warn!("{} stream disconnected: {}", concern, reason),
        }
    }

    fn on_error(&self, concern: Concern, error: &str) -> Control {
        error!("{} stream error: {}", concern, error);
        Control::Stop
    }
}

impl StreamProcessor {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        dispatcher: Arc<Dispatcher>,
        rule: FilterRule,
        config: StreamConfig,
    ) -> Self {
        Self {
            client,
            dispatcher,
            rule: Arc::new(rule),
            config,
            tracker: TaskTracker::new(),
        }
    }

    /// Open every subscription and return handles once each has made its
    /// first connection attempt. Fails only if none could be opened.
    pub async fn start(
        self: Arc<Self>,
        filters: Vec<StreamFilter>,
        cancel: CancellationToken,
    ) -> Result<StreamHandles> {
        let filters: Vec<StreamFilter> = filters
            .into_iter()
            .filter(|f| !f.track.is_empty() || !f.follow.is_empty())
            .collect();
        if filters.is_empty() {
            return Err(EngineError::Startup("no stream subscriptions configured".to_string()));
        }

        let mut handles = Vec::new();
        let mut first_attempts = Vec::new();
        for filter in filters {
            let concern = filter.concern();
            let token = cancel.child_token();
            let (state_tx, state_rx) = watch::channel(SubscriptionState::Connecting);
            let (first_tx, first_rx) = oneshot::channel();
            let task = tokio::spawn(
                self.clone()
                    .supervise(filter, token.clone(), state_tx, first_tx),
            );
            first_attempts.push(first_rx);
            handles.push(SubscriptionHandle {
                concern,
                state: state_rx,
                cancel: token,
                task,
            });
        }

        let mut opened = 0;
        for attempt in first_attempts {
            if attempt.await.unwrap_or(false) {
                opened += 1;
            }
        }
        if opened == 0 {
            for handle in handles {
                handle.cancel.cancel();
                let _ = handle.task.await;
            }
            return Err(EngineError::Startup("could not open any stream subscription".to_string()));
        }

        info!("Stream processing started with {} subscription(s)", opened);
        Ok(StreamHandles {
            processor: self,
            subscriptions: handles,
        })
    }

    /// Run until every subscription has ended, then wait for in-flight items.
    pub async fn run(self: Arc<Self>, filters: Vec<StreamFilter>, cancel: CancellationToken) -> Result<()> {
        let handles = self.start(filters, cancel).await?;
        handles.join().await;
        Ok(())
    }

    fn reconnect_backoff(&self) -> ExponentialBackoff {
        let initial = Duration::from_secs(self.config.initial_backoff_secs);
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            max_interval: Duration::from_secs(self.config.max_backoff_secs),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    async fn supervise(
        self: Arc<Self>,
        filter: StreamFilter,
        cancel: CancellationToken,
        state: watch::Sender<SubscriptionState>,
        first_attempt: oneshot::Sender<bool>,
    ) {
        let concern = filter.concern();
        let mut first_attempt = Some(first_attempt);
        let mut backoff = self.reconnect_backoff();
        let mut restarts: u32 = 0;

        loop {
            state.send_replace(SubscriptionState::Connecting);
            info!("Connecting {} subscription", concern);

            let connected = tokio::select! {
                _ = cancel.cancelled() => None,
                result = self.client.subscribe(&filter) => Some(result),
            };
            let end = match connected {
                None => SessionEnd::Cancelled,
                Some(Ok(subscription)) => {
                    backoff.reset();
                    state.send_replace(SubscriptionState::Streaming);
                    if let Some(tx) = first_attempt.take() {
                        let _ = tx.send(true);
                    }
                    info!("{} subscription streaming", concern);
                    drive(self.as_ref(), concern, subscription, &cancel).await
                }
                Some(Err(e)) => {
                    error!("Could not open {} subscription: {}", concern, e);
                    if let Some(tx) = first_attempt.take() {
                        state.send_replace(SubscriptionState::ErrorTerminated);
                        let _ = tx.send(false);
                    }
                    SessionEnd::ErrorTerminated { calm: false }
                }
            };

            state.send_replace(end.state());
            if end == SessionEnd::Cancelled {
                info!("{} subscription cancelled", concern);
                break;
            }
            if !self.config.restart {
                info!("{} subscription ended ({:?}), restart disabled", concern, end);
                break;
            }
            if let Some(max) = self.config.max_restarts {
                if restarts >= max {
                    warn!("{} subscription reached its restart limit ({})", concern, max);
                    break;
                }
            }

            let mut delay = backoff
                .next_backoff()
                .unwrap_or_else(|| Duration::from_secs(self.config.max_backoff_secs));
            if end == (SessionEnd::ErrorTerminated { calm: true }) {
                delay = delay.max(Duration::from_secs(self.config.enhance_calm_secs));
            }
            info!("Restarting {} subscription in {:?}", concern, delay);
            tokio::select! {
                _ = cancel.cancelled() => {
                    state.send_replace(SubscriptionState::Cancelled);
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            restarts += 1;
        }
        if let Some(tx) = first_attempt.take() {
            let _ = tx.send(false);
        }
    }
}

/// Control over one supervised subscription.
pub struct SubscriptionHandle {
    concern: Concern,
    state: watch::Receiver<SubscriptionState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn concern(&self) -> Concern {
        self.concern
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Stop this subscription only; the others keep running.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the subscription reports `wanted`. Returns false if the
    /// supervisor exited first.
    pub async fn wait_for(&mut self, wanted: SubscriptionState) -> bool {
        self.state.wait_for(|state| *state == wanted).await.is_ok()
    }
}

pub struct StreamHandles {
    processor: Arc<StreamProcessor>,
    subscriptions: Vec<SubscriptionHandle>,
}

impl StreamHandles {
    pub fn get(&self, concern: Concern) -> Option<&SubscriptionHandle> {
        self.subscriptions.iter().find(|s| s.concern == concern)
    }

    pub fn get_mut(&mut self, concern: Concern) -> Option<&mut SubscriptionHandle> {
        self.subscriptions.iter_mut().find(|s| s.concern == concern)
    }

    /// Wait for every supervisor to finish, then for in-flight item tasks.
    pub async fn join(self) {
        for subscription in self.subscriptions {
            if let Err(e) = subscription.task.await {
                error!("{} supervisor panicked: {}", subscription.concern, e);
            }
        }
        self.processor.tracker.close();
        self.processor.tracker.wait().await;
        info!("Stream processing stopped");
    }
}
