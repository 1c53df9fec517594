use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::{DispatchConfig, JitterWindow};
use crate::filter::Reactions;
use crate::types::{ActionKind, ActionOutcome, Item, RemoteClient, RemoteError};

/// Executes single idempotent actions against the remote client.
///
/// Waits are scoped to the calling task: a cool-down in one item's pipeline
/// does not hold up any other caller.
pub struct Dispatcher {
    client: Arc<dyn RemoteClient>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn RemoteClient>, config: DispatchConfig) -> Self {
        Self { client, config }
    }

    pub async fn perform(&self, kind: ActionKind, target: u64) -> ActionOutcome {
        if let Some(window) = &self.config.jitter {
            let wait = draw_jitter(window);
            debug!("Waiting {:?} before {} {}", wait, kind, target);
            tokio::time::sleep(wait).await;
        }

        match self.client.call(kind, target).await {
            Ok(()) => {
                info!("{} {} succeeded", kind, target);
                ActionOutcome::Succeeded
            }
            Err(e) => {
                let outcome = self.classify(&e);
                match outcome {
                    ActionOutcome::AlreadyDone => {
                        debug!("{} {} already done: {}", kind, target, e);
                    }
                    ActionOutcome::RateLimited => {
                        let cooldown = self.config.cooldown();
                        warn!(
                            "{} {} failed without an error code ({}), cooling down for {:?}",
                            kind, target, e, cooldown
                        );
                        tokio::time::sleep(cooldown).await;
                    }
                    _ => {
                        error!("{} {} failed: {}", kind, target, e);
                    }
                }
                outcome
            }
        }
    }

    /// Like [`perform`](Self::perform), but a `(kind, target)` pair already in
    /// the ledger is not attempted again and yields `None`.
    pub async fn perform_once(
        &self,
        ledger: &mut ActionLedger,
        kind: ActionKind,
        target: u64,
    ) -> Option<ActionOutcome> {
        if let Some(previous) = ledger.outcome(kind, target) {
            debug!("Skipping {} {}: already attempted this pass ({:?})", kind, target, previous);
            return None;
        }
        let outcome = self.perform(kind, target).await;
        ledger.record(kind, target, outcome);
        Some(outcome)
    }

    /// Run the qualifying reactions for one item concurrently.
    pub async fn react(&self, item: &Item, reactions: Reactions) -> Vec<(ActionKind, ActionOutcome)> {
        let retweet = async {
            if reactions.retweet {
                Some((ActionKind::Retweet, self.perform(ActionKind::Retweet, item.id).await))
            } else {
                None
            }
        };
        let favorite = async {
            if reactions.favorite {
                Some((ActionKind::Favorite, self.perform(ActionKind::Favorite, item.id).await))
            } else {
                None
            }
        };
        let (retweet, favorite) = futures::join!(retweet, favorite);
        retweet.into_iter().chain(favorite).collect()
    }

    pub fn classify(&self, error: &RemoteError) -> ActionOutcome {
        match error {
            RemoteError::Api { code, .. } if self.config.duplicate_codes.contains(code) => {
                ActionOutcome::AlreadyDone
            }
            RemoteError::Api { .. } | RemoteError::NotFound(_) => ActionOutcome::Failed,
            RemoteError::Unstructured(_) => ActionOutcome::RateLimited,
        }
    }
}

fn draw_jitter(window: &JitterWindow) -> Duration {
    let mut rng = rand::thread_rng();
    let floor = rng.gen_range(window.floor_min_secs..=window.floor_max_secs.max(window.floor_min_secs));
    let ceiling = window.ceiling_secs.max(floor);
    Duration::from_secs(rng.gen_range(floor..=ceiling))
}

/// Per-pass record of attempted actions.
#[derive(Debug, Default)]
pub struct ActionLedger {
    attempted: HashMap<(ActionKind, u64), ActionOutcome>,
}

impl ActionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcome(&self, kind: ActionKind, target: u64) -> Option<ActionOutcome> {
        self.attempted.get(&(kind, target)).copied()
    }

    pub fn record(&mut self, kind: ActionKind, target: u64, outcome: ActionOutcome) {
        self.attempted.insert((kind, target), outcome);
    }

    pub fn count(&self, kind: ActionKind) -> usize {
        self.attempted.keys().filter(|(k, _)| *k == kind).count()
    }

    pub fn len(&self) -> usize {
        self.attempted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempted.is_empty()
    }
}
