use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AgentConfig;
use crate::crawler::Crawler;
use crate::dispatcher::Dispatcher;
use crate::pages::AccountPages;
use crate::stream::StreamProcessor;
use crate::sweeper::Sweeper;
use crate::types::{Account, CrawlReport, RemoteClient, Result, StreamFilter, SweepReport};

/// Wires the engine components around one shared remote client.
pub struct Agent {
    client: Arc<dyn RemoteClient>,
    config: AgentConfig,
    dispatcher: Arc<Dispatcher>,
    crawler: Crawler,
    sweeper: Sweeper,
}

impl Agent {
    pub fn new(client: Arc<dyn RemoteClient>, config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let dispatcher = Arc::new(Dispatcher::new(client.clone(), config.dispatch.clone()));
        let crawler = Crawler::new(client.clone(), dispatcher.clone(), config.crawl.clone());
        let sweeper = Sweeper::new(client.clone(), dispatcher.clone());
        Ok(Self {
            client,
            config,
            dispatcher,
            crawler,
            sweeper,
        })
    }

    pub fn subscriptions(&self) -> Vec<StreamFilter> {
        let mut filters = Vec::new();
        if !self.config.track.is_empty() {
            filters.push(StreamFilter::track(self.config.track.clone()));
        }
        if !self.config.follow_ids.is_empty() {
            filters.push(StreamFilter::follow(self.config.follow_ids.clone()));
        }
        filters
    }

    pub fn stream_processor(&self) -> Arc<StreamProcessor> {
        Arc::new(StreamProcessor::new(
            self.client.clone(),
            self.dispatcher.clone(),
            self.config.rule.clone(),
            self.config.stream.clone(),
        ))
    }

    /// Long-lived: returns once every subscription has ended or `cancel`
    /// fires.
    pub async fn run_stream(&self, cancel: CancellationToken) -> Result<()> {
        self.stream_processor()
            .run(self.subscriptions(), cancel)
            .await
    }

    pub async fn crawl_once(&self, previous_count: Option<u64>, cancel: &CancellationToken) -> Result<CrawlReport> {
        self.crawler
            .crawl(&self.config.crawl.source, &self.config.rule, previous_count, cancel)
            .await
    }

    /// Crawl on a fixed interval until cancelled, carrying the follower
    /// count from one pass to the next. Shutdown only happens between
    /// entries or while waiting. Returns the last count observed.
    pub async fn run_poll_loop(&self, cancel: CancellationToken) -> Result<Option<u64>> {
        let mut last_count = None;
        let interval = self.config.crawl.interval();

        while !cancel.is_cancelled() {
            match self.crawl_once(last_count, &cancel).await {
                Ok(report) if !report.cancelled => last_count = Some(report.follower_count),
                Ok(_) => break,
                Err(e) => error!("Crawl pass failed: {}", e),
            }

            info!("Next crawl pass in {:?}", interval);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Poll loop stopped");
        Ok(last_count)
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweeper.sweep(&self.config.allow_list).await
    }

    /// Every account the agent follows, in service order. A failed page ends
    /// the listing early; whatever was read before it is still returned.
    pub async fn list_friends(&self) -> Result<Vec<Account>> {
        let me = self.client.me().await?;
        let mut pages = AccountPages::following(self.client.clone(), me.id);
        let (friends, page_error) = pages.drain().await;
        for friend in &friends {
            info!("@{} follows @{}", me.screen_name, friend.screen_name);
        }
        if let Some(e) = page_error {
            error!(
                "Listing friends stopped after {} page(s): {}",
                pages.pages_fetched(),
                e
            );
        }
        info!("@{} follows {} accounts", me.screen_name, friends.len());
        Ok(friends)
    }

    /// Stream processing and the poll loop side by side.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.subscriptions().is_empty() {
            info!("No stream subscriptions configured, running the poll loop only");
            self.run_poll_loop(cancel).await?;
            return Ok(());
        }
        let stream = async {
            let result = self.run_stream(cancel.clone()).await;
            if result.is_err() {
                cancel.cancel();
            }
            result
        };
        let (stream, poll) = tokio::join!(stream, self.run_poll_loop(cancel.clone()));
        stream?;
        poll?;
        Ok(())
    }
}
