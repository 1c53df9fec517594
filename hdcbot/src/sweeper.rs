use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::pages::AccountPages;
use crate::types::{AccountId, ActionKind, RemoteClient, Result, SweepReport};

/// One-shot removal of non-mutual follows.
pub struct Sweeper {
    client: Arc<dyn RemoteClient>,
    dispatcher: Arc<Dispatcher>,
}

impl Sweeper {
    pub fn new(client: Arc<dyn RemoteClient>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { client, dispatcher }
    }

    /// Unfollow every followed account that does not follow back, except
    /// those on `allow_list`. The following list is read in full before any
    /// unfollow so removals cannot shift the cursor. If a page fails, the
    /// accounts read before it are still swept.
    pub async fn sweep(&self, allow_list: &[AccountId]) -> Result<SweepReport> {
        let me = self.client.me().await?;
        let allowed: HashSet<AccountId> = allow_list.iter().copied().collect();
        let mut report = SweepReport::default();

        let mut pages = AccountPages::following(self.client.clone(), me.id);
        let (following, page_error) = pages.drain().await;
        if let Some(e) = page_error {
            error!(
                "Following list stopped after {} page(s), sweeping what was read: {}",
                pages.pages_fetched(),
                e
            );
            report.failed += 1;
        }
        info!("Sweeping {} followed accounts", following.len());

        for account in following {
            report.checked += 1;
            if allowed.contains(&account.id) {
                debug!("Keeping @{}: on the allow list", account.screen_name);
                report.kept_allowed += 1;
                continue;
            }

            let relationship = match self.client.relationship(me.id, account.id).await {
                Ok(relationship) => relationship,
                Err(e) => {
                    warn!("Relationship check for @{} failed, skipping: {}", account.screen_name, e);
                    report.failed += 1;
                    continue;
                }
            };
            if relationship.b_follows_a {
                debug!("Keeping @{}: mutual", account.screen_name);
                report.kept_mutual += 1;
                continue;
            }

            let outcome = self.dispatcher.perform(ActionKind::Unfollow, account.id).await;
            if outcome.is_settled() {
                info!("Unfollowed @{}", account.screen_name);
                report.unfollowed.push(account.id);
            } else {
                report.failed += 1;
            }
        }

        info!(
            "Sweep done: {} checked, {} unfollowed, {} mutual, {} allowed, {} failed",
            report.checked,
            report.unfollowed.len(),
            report.kept_mutual,
            report.kept_allowed,
            report.failed
        );
        Ok(report)
    }
}
