mod common;

use std::sync::Arc;

use hdcbot::AccountPages;
use interfaces::memory::Op;
use interfaces::MemoryClient;

use common::{account, init_tracing, me, ME};

fn followed_by_five() -> Arc<MemoryClient> {
    let mut client = MemoryClient::new(me()).with_page_size(2);
    for id in 10..15 {
        client = client
            .with_account(account(id, &format!("account{}", id), 200, 100))
            .with_follow(id, ME);
    }
    Arc::new(client)
}

#[tokio::test]
async fn test_pages_are_fetched_lazily() {
    init_tracing();
    let client = followed_by_five();
    let mut pages = AccountPages::followers(client.clone(), ME);

    assert_eq!(pages.pages_fetched(), 0);
    assert_eq!(pages.next().await.unwrap().unwrap().id, 10);
    assert_eq!(pages.next().await.unwrap().unwrap().id, 11);
    assert_eq!(pages.pages_fetched(), 1);
    assert_eq!(pages.next().await.unwrap().unwrap().id, 12);
    assert_eq!(pages.pages_fetched(), 2);

    let cursors: Vec<Option<u64>> = client
        .calls()
        .await
        .into_iter()
        .filter_map(|record| match record.op {
            Op::ListFollowers(_, cursor) => Some(cursor),
            _ => None,
        })
        .collect();
    assert_eq!(cursors, vec![None, Some(2)]);
}

#[tokio::test]
async fn test_walk_can_restart_from_the_first_page() {
    init_tracing();
    let client = followed_by_five();
    let mut pages = AccountPages::followers(client, ME);

    let mut first_pass = Vec::new();
    while let Some(next) = pages.next().await {
        first_pass.push(next.unwrap().id);
    }
    assert_eq!(first_pass, vec![10, 11, 12, 13, 14]);
    assert!(pages.next().await.is_none());

    pages.restart();
    assert_eq!(pages.next().await.unwrap().unwrap().id, 10);
    let (rest, error) = pages.drain().await;
    assert_eq!(rest.len(), 4);
    assert!(error.is_none());
}

#[tokio::test]
async fn test_drain_returns_accounts_read_before_a_failed_page() {
    init_tracing();
    let client = followed_by_five();
    client.break_page(ME, 2).await;
    let mut pages = AccountPages::followers(client, ME);

    let (accounts, error) = pages.drain().await;
    assert_eq!(accounts.iter().map(|a| a.id).collect::<Vec<_>>(), vec![10, 11]);
    assert!(error.is_some());
    assert_eq!(pages.pages_fetched(), 1);
    assert!(pages.next().await.is_none());
}
