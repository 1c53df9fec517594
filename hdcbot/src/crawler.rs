//! Paced batch crawl over follower lists and watch lists.
//!
//! Entries are handled strictly one after another: pacing only works if the
//! count of processed entries is exact, so nothing here runs concurrently.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CrawlConfig, CrawlSource, FilterRule};
use crate::dispatcher::{ActionLedger, Dispatcher};
use crate::filter::{self, Decision};
use crate::pages::AccountPages;
use crate::types::{
    Account, AccountKey, ActionKind, ActionOutcome, CrawlReport, RemoteClient, Result,
};

enum Entries {
    Pages(AccountPages),
    Keys(std::vec::IntoIter<AccountKey>),
}

enum Entry {
    Resolved(Account),
    Key(AccountKey),
}

impl Entries {
    async fn next(&mut self) -> Option<std::result::Result<Entry, String>> {
        match self {
            Self::Pages(pages) => pages
                .next()
                .await
                .map(|next| next.map(Entry::Resolved).map_err(|e| e.to_string())),
            Self::Keys(keys) => keys.next().map(|key| Ok(Entry::Key(key))),
        }
    }
}

pub struct Crawler {
    client: Arc<dyn RemoteClient>,
    dispatcher: Arc<Dispatcher>,
    config: CrawlConfig,
}

impl Crawler {
    pub fn new(client: Arc<dyn RemoteClient>, dispatcher: Arc<Dispatcher>, config: CrawlConfig) -> Self {
        Self {
            client,
            dispatcher,
            config,
        }
    }

    /// One pass over `source`. `previous_count` is the follower count the
    /// last pass returned; for `MyFollowers` an unchanged count skips the
    /// pass entirely.
    pub async fn crawl(
        &self,
        source: &CrawlSource,
        rule: &FilterRule,
        previous_count: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<CrawlReport> {
        let me = self.client.me().await?;

        let (mut entries, follower_count) = match source {
            CrawlSource::MyFollowers => {
                if previous_count == Some(me.followers_count) {
                    info!("Follower count unchanged at {}, skipping pass", me.followers_count);
                    let mut report = CrawlReport::started(me.followers_count);
                    report.short_circuited = true;
                    return Ok(report.finish());
                }
                info!(
                    "Crawling followers of @{} ({} followers)",
                    me.screen_name, me.followers_count
                );
                (
                    Entries::Pages(AccountPages::followers(self.client.clone(), me.id)),
                    Some(me.followers_count),
                )
            }
            CrawlSource::FollowersOf(key) => {
                let target = self.client.get_account(key).await?;
                info!(
                    "Crawling followers of @{} ({} followers)",
                    target.screen_name, target.followers_count
                );
                (
                    Entries::Pages(AccountPages::followers(self.client.clone(), target.id)),
                    Some(target.followers_count),
                )
            }
            CrawlSource::WatchList(keys) => {
                info!("Crawling watch list of {} accounts", keys.len());
                (Entries::Keys(keys.clone().into_iter()), None)
            }
        };

        let mut report = CrawlReport::started(follower_count.unwrap_or(0));
        let mut ledger = ActionLedger::new();
        let mut seen_keys = HashSet::new();
        let mut seen_ids = HashSet::new();
        let batch_size = self.config.batch_size.max(1);

        while let Some(next) = entries.next().await {
            if cancel.is_cancelled() {
                info!("Crawl cancelled after {} entries", report.processed);
                report.cancelled = true;
                break;
            }

            let entry = match next {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Could not fetch the next page of entries: {}", e);
                    report.failed += 1;
                    break;
                }
            };
            match &entry {
                Entry::Resolved(account) if !seen_ids.insert(account.id) => {
                    debug!("Skipping @{}: already visited this pass", account.screen_name);
                    continue;
                }
                Entry::Key(key) if !seen_keys.insert(key.clone()) => {
                    debug!("Skipping {}: listed twice", key);
                    continue;
                }
                _ => {}
            }

            if report.processed > 0 && report.processed % batch_size == 0 {
                let pause = self.config.pause();
                info!("Processed {} entries, pausing for {:?}", report.processed, pause);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Crawl cancelled during pause");
                        report.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            let account = match entry {
                Entry::Resolved(account) => Some(account),
                Entry::Key(key) => match self.client.get_account(&key).await {
                    Ok(account) if seen_ids.insert(account.id) => Some(account),
                    Ok(account) => {
                        debug!("Skipping @{}: already visited this pass", account.screen_name);
                        None
                    }
                    Err(e) => {
                        warn!("Lookup of {} failed, skipping: {}", key, e);
                        report.failed += 1;
                        None
                    }
                },
            };
            if let Some(account) = account {
                self.visit(&me, &account, rule, &mut ledger, &mut report).await;
            }
            report.processed += 1;
        }

        if follower_count.is_none() {
            report.follower_count = report.processed as u64;
        }
        let report = report.finish();
        info!(
            "Crawl pass done: {} processed, {} followed, {} skipped, {} failed, {} reactions",
            report.processed, report.followed, report.skipped, report.failed, report.reactions
        );
        Ok(report)
    }

    async fn visit(
        &self,
        me: &Account,
        account: &Account,
        rule: &FilterRule,
        ledger: &mut ActionLedger,
        report: &mut CrawlReport,
    ) {
        if account.id == me.id {
            report.skipped += 1;
            return;
        }

        if account.following {
            debug!("Already following @{}", account.screen_name);
            report.skipped += 1;
        } else if filter::eligible_to_follow(account, rule) {
            match self
                .dispatcher
                .perform_once(ledger, ActionKind::Follow, account.id)
                .await
            {
                Some(ActionOutcome::Succeeded) => report.followed += 1,
                Some(ActionOutcome::AlreadyDone) | None => report.skipped += 1,
                Some(ActionOutcome::RateLimited) | Some(ActionOutcome::Failed) => report.failed += 1,
            }
        } else {
            debug!(
                "@{} fails the ratio guard ({} followers, {} following)",
                account.screen_name, account.followers_count, account.friends_count
            );
            report.skipped += 1;
        }

        if self.config.recent_items == 0 {
            return;
        }
        let items = match self.client.recent_items(account.id, self.config.recent_items).await {
            Ok(items) => items,
            Err(e) => {
                warn!("Could not fetch recent items of @{}: {}", account.screen_name, e);
                report.failed += 1;
                return;
            }
        };
        for item in items {
            if let Decision::Reject(reason) = filter::decide(&item, rule) {
                debug!("Rejected item {} from @{}: {}", item.id, account.screen_name, reason);
                continue;
            }
            let reactions = filter::reactions(&item, rule);
            let kinds = [
                (reactions.retweet, ActionKind::Retweet),
                (reactions.favorite, ActionKind::Favorite),
            ];
            for (wanted, kind) in kinds {
                if !wanted {
                    continue;
                }
                if let Some(ActionOutcome::Succeeded) =
                    self.dispatcher.perform_once(ledger, kind, item.id).await
                {
                    report.reactions += 1;
                }
            }
        }
    }
}
