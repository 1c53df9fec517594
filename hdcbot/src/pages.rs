use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::types::{Account, AccountId, RemoteClient, RemoteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Followers,
    Following,
}

/// Lazy, restartable walk over a cursored account list. A page is only
/// requested once the previous one has been consumed.
pub struct AccountPages {
    client: Arc<dyn RemoteClient>,
    of: AccountId,
    direction: Direction,
    buffer: VecDeque<Account>,
    cursor: Option<u64>,
    pages_fetched: usize,
    exhausted: bool,
}

impl AccountPages {
    pub fn followers(client: Arc<dyn RemoteClient>, of: AccountId) -> Self {
        Self::new(client, of, Direction::Followers)
    }

    pub fn following(client: Arc<dyn RemoteClient>, of: AccountId) -> Self {
        Self::new(client, of, Direction::Following)
    }

    fn new(client: Arc<dyn RemoteClient>, of: AccountId, direction: Direction) -> Self {
        Self {
            client,
            of,
            direction,
            buffer: VecDeque::new(),
            cursor: None,
            pages_fetched: 0,
            exhausted: false,
        }
    }

    /// Next account, `None` when the list is exhausted. A failed page ends
    /// the walk after the error is returned.
    pub async fn next(&mut self) -> Option<Result<Account, RemoteError>> {
        loop {
            if let Some(account) = self.buffer.pop_front() {
                return Some(Ok(account));
            }
            if self.exhausted {
                return None;
            }

            let page = match self.direction {
                Direction::Followers => self.client.list_followers(self.of, self.cursor).await,
                Direction::Following => self.client.list_following(self.of, self.cursor).await,
            };
            match page {
                Ok(page) => {
                    self.pages_fetched += 1;
                    debug!(
                        "Fetched {:?} page {} of {} ({} accounts)",
                        self.direction,
                        self.pages_fetched,
                        self.of,
                        page.items.len()
                    );
                    self.buffer.extend(page.items);
                    match page.next_cursor {
                        Some(next) => self.cursor = Some(next),
                        None => self.exhausted = true,
                    }
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
    }

    /// Start over from the first page.
    pub fn restart(&mut self) {
        self.buffer.clear();
        self.cursor = None;
        self.exhausted = false;
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Drain the remaining accounts. A failed page ends the walk; whatever
    /// was read before it is returned alongside the error.
    pub async fn drain(&mut self) -> (Vec<Account>, Option<RemoteError>) {
        let mut accounts = Vec::new();
        while let Some(next) = self.next().await {
            match next {
                Ok(account) => accounts.push(account),
                Err(e) => return (accounts, Some(e)),
            }
        }
        (accounts, None)
    }
}
