mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hdcbot::stream::{drive, Control, SessionEnd, StreamListener};
use hdcbot::{
    ActionKind, Concern, EngineError, Item, RemoteError, StreamConfig, StreamEvent, StreamFilter,
    StreamProcessor, SubscriptionState,
};
use interfaces::memory::{CallRecord, Op};
use interfaces::{MemoryClient, RemoteClient, ScriptedSession, Subscription};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::{account, dispatcher, init_tracing, item, me, no_jitter, open_rule};

fn payload(item: &Item) -> StreamEvent {
    StreamEvent::Payload(serde_json::to_string(item).unwrap())
}

fn track() -> StreamFilter {
    StreamFilter::track(vec!["rust".to_string()])
}

fn processor(client: &Arc<MemoryClient>, config: StreamConfig) -> Arc<StreamProcessor> {
    Arc::new(StreamProcessor::new(
        client.clone(),
        dispatcher(client, no_jitter(15)),
        open_rule(),
        config,
    ))
}

fn no_restart() -> StreamConfig {
    StreamConfig {
        restart: false,
        ..Default::default()
    }
}

fn subscribes(calls: &[CallRecord], concern: Concern) -> Vec<Instant> {
    calls
        .iter()
        .filter(|record| record.op == Op::Subscribe(concern))
        .map(|record| record.at)
        .collect()
}

#[derive(Default)]
struct Recorder {
    items: Mutex<Vec<u64>>,
    disconnects: Mutex<Vec<Option<u16>>>,
    errors: Mutex<Vec<String>>,
}

impl StreamListener for Recorder {
    fn on_item(&self, _concern: Concern, item: Item) {
        self.items.lock().unwrap().push(item.id);
    }

    fn on_disconnect(&self, _concern: Concern, status: Option<u16>, _reason: &str) {
        self.disconnects.lock().unwrap().push(status);
    }

    fn on_error(&self, _concern: Concern, error: &str) -> Control {
        self.errors.lock().unwrap().push(error.to_string());
        Control::Continue
    }
}

#[tokio::test]
async fn test_drive_drops_bad_payloads_and_reports_calm() {
    init_tracing();
    let alice = account(10, "alice", 500, 20);
    let (tx, rx) = mpsc::channel(16);
    for event in [
        StreamEvent::Connected,
        payload(&item(100, &alice, "rust news")),
        StreamEvent::Payload("{not json".to_string()),
        StreamEvent::Payload(r#"{"foo": 1}"#.to_string()),
        StreamEvent::Payload(r#"{"limit": {"track": 12}}"#.to_string()),
        StreamEvent::Error("hiccup".to_string()),
        payload(&item(101, &alice, "more rust")),
        StreamEvent::Disconnected {
            status: Some(420),
            reason: "Enhance Your Calm".to_string(),
        },
        payload(&item(102, &alice, "never delivered")),
    ] {
        tx.send(event).await.unwrap();
    }
    drop(tx);

    let recorder = Recorder::default();
    let subscription = Subscription::new(rx, CancellationToken::new());
    let end = drive(&recorder, Concern::Track, subscription, &CancellationToken::new()).await;

    assert_eq!(end, SessionEnd::ErrorTerminated { calm: true });
    assert_eq!(*recorder.items.lock().unwrap(), vec![100, 101]);
    assert_eq!(*recorder.errors.lock().unwrap(), vec!["hiccup".to_string()]);
    assert_eq!(*recorder.disconnects.lock().unwrap(), vec![Some(420)]);
}

#[tokio::test]
async fn test_drive_ends_on_close_and_cancel() {
    init_tracing();
    let recorder = Recorder::default();

    let (tx, rx) = mpsc::channel(4);
    drop(tx);
    let end = drive(
        &recorder,
        Concern::Follow,
        Subscription::new(rx, CancellationToken::new()),
        &CancellationToken::new(),
    )
    .await;
    assert_eq!(end, SessionEnd::Disconnected);
    assert_eq!(*recorder.disconnects.lock().unwrap(), vec![None]);

    let (_tx, rx) = mpsc::channel(4);
    let subscription = Subscription::new(rx, CancellationToken::new());
    let producer = subscription.cancel_token();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let end = drive(&recorder, Concern::Follow, subscription, &cancel).await;
    assert_eq!(end, SessionEnd::Cancelled);
    assert!(producer.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_items_are_filtered_and_engaged() -> hdcbot::Result<()> {
    init_tracing();
    let alice = account(10, "alice", 500, 20);
    let first = item(100, &alice, "rust news");
    let second = item(101, &alice, "more rust");
    let mut reply = item(102, &alice, "rust reply");
    reply.in_reply_to_user_id = Some(55);
    let client = Arc::new(
        MemoryClient::new(me())
            .with_account(alice)
            .with_items(10, vec![first.clone(), second.clone(), reply.clone()])
            .with_session(
                Concern::Track,
                ScriptedSession::new(vec![
                    StreamEvent::Connected,
                    payload(&first),
                    StreamEvent::Payload("{not json".to_string()),
                    StreamEvent::Payload(r#"{"foo": 1}"#.to_string()),
                    StreamEvent::Payload(r#"{"delete": {"status": {"id": 1}}}"#.to_string()),
                    payload(&reply),
                    payload(&second),
                ]),
            ),
    );

    processor(&client, no_restart())
        .run(vec![track()], CancellationToken::new())
        .await?;

    let actions: HashSet<(ActionKind, u64)> = client.actions().await.into_iter().collect();
    let expected: HashSet<(ActionKind, u64)> = [
        (ActionKind::Retweet, 100),
        (ActionKind::Favorite, 100),
        (ActionKind::Retweet, 101),
        (ActionKind::Favorite, 101),
    ]
    .into_iter()
    .collect();
    assert_eq!(actions, expected);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_slow_item_does_not_block_the_next() -> hdcbot::Result<()> {
    init_tracing();
    let alice = account(10, "alice", 500, 20);
    let slow = item(100, &alice, "rust news");
    let fast = item(101, &alice, "more rust");
    let client = Arc::new(
        MemoryClient::new(me())
            .with_account(alice)
            .with_items(10, vec![slow.clone(), fast.clone()])
            .with_session(
                Concern::Track,
                ScriptedSession::new(vec![payload(&slow), payload(&fast)]).held_open(),
            ),
    );
    let latency = Duration::from_secs(600);
    client.set_latency(100, latency).await;
    let cancel = CancellationToken::new();
    let start = Instant::now();

    let handles = processor(&client, StreamConfig::default())
        .start(vec![track()], cancel.clone())
        .await?;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let calls = client.calls().await;
    let fast_calls: Vec<&CallRecord> = calls
        .iter()
        .filter(|record| matches!(record.op, Op::Action(_, 101)))
        .collect();
    assert_eq!(fast_calls.len(), 2);
    for record in fast_calls {
        assert!(record.at - start < latency);
    }

    // Cancelling still lets the slow item finish its actions.
    cancel.cancel();
    handles.join().await;
    assert!(start.elapsed() >= latency);
    let items = client.recent_items(10, 5).await?;
    let finished = items.iter().find(|item| item.id == 100).unwrap();
    assert!(finished.retweeted && finished.favorited);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_enhance_your_calm() -> hdcbot::Result<()> {
    init_tracing();
    let alice = account(10, "alice", 500, 20);
    let before = item(100, &alice, "rust news");
    let after = item(101, &alice, "more rust");
    let client = Arc::new(
        MemoryClient::new(me())
            .with_account(alice)
            .with_items(10, vec![before.clone(), after.clone()])
            .with_session(
                Concern::Track,
                ScriptedSession::new(vec![
                    payload(&before),
                    StreamEvent::Disconnected {
                        status: Some(420),
                        reason: "Enhance Your Calm".to_string(),
                    },
                ]),
            )
            .with_session(
                Concern::Track,
                ScriptedSession::new(vec![payload(&after)]).held_open(),
            ),
    );
    let config = StreamConfig {
        initial_backoff_secs: 1,
        enhance_calm_secs: 60,
        ..Default::default()
    };
    let cancel = CancellationToken::new();

    let handles = processor(&client, config)
        .start(vec![track()], cancel.clone())
        .await?;
    tokio::time::sleep(Duration::from_secs(120)).await;

    let attempts = subscribes(&client.calls().await, Concern::Track);
    assert_eq!(attempts.len(), 2);
    assert!(attempts[1] - attempts[0] >= Duration::from_secs(60));
    assert_eq!(
        handles.get(Concern::Track).unwrap().state(),
        SubscriptionState::Streaming
    );
    assert!(client.actions().await.contains(&(ActionKind::Retweet, 101)));

    cancel.cancel();
    handles.join().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_plain_disconnect_restarts_with_backoff() -> hdcbot::Result<()> {
    init_tracing();
    let client = Arc::new(
        MemoryClient::new(me())
            .with_session(Concern::Track, ScriptedSession::new(vec![]))
            .with_session(Concern::Track, ScriptedSession::new(vec![]).held_open()),
    );
    let config = StreamConfig {
        initial_backoff_secs: 2,
        enhance_calm_secs: 60,
        ..Default::default()
    };
    let cancel = CancellationToken::new();

    let handles = processor(&client, config)
        .start(vec![track()], cancel.clone())
        .await?;
    tokio::time::sleep(Duration::from_secs(30)).await;

    let attempts = subscribes(&client.calls().await, Concern::Track);
    assert_eq!(attempts.len(), 2);
    let gap = attempts[1] - attempts[0];
    assert!(gap >= Duration::from_secs(1), "gap {:?}", gap);
    assert!(gap < Duration::from_secs(60), "gap {:?}", gap);

    cancel.cancel();
    handles.join().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_restart_limit_ends_the_subscription() -> hdcbot::Result<()> {
    init_tracing();
    let client = Arc::new(
        MemoryClient::new(me())
            .with_session(Concern::Track, ScriptedSession::new(vec![]))
            .with_session(Concern::Track, ScriptedSession::new(vec![]))
            .with_session(Concern::Track, ScriptedSession::new(vec![])),
    );
    let config = StreamConfig {
        max_restarts: Some(1),
        ..Default::default()
    };

    processor(&client, config)
        .run(vec![track()], CancellationToken::new())
        .await?;

    assert_eq!(subscribes(&client.calls().await, Concern::Track).len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_cancel_independently() -> hdcbot::Result<()> {
    init_tracing();
    let client = Arc::new(
        MemoryClient::new(me())
            .with_session(Concern::Track, ScriptedSession::default().held_open())
            .with_session(Concern::Follow, ScriptedSession::default().held_open()),
    );
    let cancel = CancellationToken::new();

    let mut handles = processor(&client, StreamConfig::default())
        .start(
            vec![track(), StreamFilter::follow(vec![10, 11])],
            cancel.clone(),
        )
        .await?;

    let tracked = handles.get_mut(Concern::Track).unwrap();
    tracked.cancel();
    assert!(tracked.wait_for(SubscriptionState::Cancelled).await);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        handles.get(Concern::Follow).unwrap().state(),
        SubscriptionState::Streaming
    );
    assert_eq!(subscribes(&client.calls().await, Concern::Track).len(), 1);

    cancel.cancel();
    assert!(handles
        .get_mut(Concern::Follow)
        .unwrap()
        .wait_for(SubscriptionState::Cancelled)
        .await);
    handles.join().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_first_connect_is_retried() -> hdcbot::Result<()> {
    init_tracing();
    let client = Arc::new(
        MemoryClient::new(me())
            .with_session(Concern::Track, ScriptedSession::default().held_open())
            .with_session(Concern::Follow, ScriptedSession::default().held_open()),
    );
    client
        .fail_next_subscribe(
            Concern::Track,
            RemoteError::Unstructured("connection reset".to_string()),
        )
        .await;
    let cancel = CancellationToken::new();

    let mut handles = processor(&client, StreamConfig::default())
        .start(vec![track(), StreamFilter::follow(vec![10])], cancel.clone())
        .await?;

    assert_eq!(
        handles.get(Concern::Track).unwrap().state(),
        SubscriptionState::ErrorTerminated
    );
    assert_eq!(
        handles.get(Concern::Follow).unwrap().state(),
        SubscriptionState::Streaming
    );

    let tracked = handles.get_mut(Concern::Track).unwrap();
    assert!(tracked.wait_for(SubscriptionState::Streaming).await);

    let attempts = subscribes(&client.calls().await, Concern::Track);
    assert_eq!(attempts.len(), 2);
    assert!(attempts[1] - attempts[0] >= Duration::from_secs(2));
    assert_eq!(subscribes(&client.calls().await, Concern::Follow).len(), 1);

    cancel.cancel();
    handles.join().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_first_connect_stays_down_without_restart() -> hdcbot::Result<()> {
    init_tracing();
    let client = Arc::new(
        MemoryClient::new(me())
            .with_session(Concern::Follow, ScriptedSession::default().held_open()),
    );
    let cancel = CancellationToken::new();

    let handles = processor(&client, no_restart())
        .start(vec![track(), StreamFilter::follow(vec![10])], cancel.clone())
        .await?;
    tokio::time::sleep(Duration::from_secs(600)).await;

    assert_eq!(
        handles.get(Concern::Track).unwrap().state(),
        SubscriptionState::ErrorTerminated
    );
    assert_eq!(subscribes(&client.calls().await, Concern::Track).len(), 1);
    assert_eq!(
        handles.get(Concern::Follow).unwrap().state(),
        SubscriptionState::Streaming
    );

    cancel.cancel();
    handles.join().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_startup_fails_when_nothing_opens() {
    init_tracing();
    let client = Arc::new(MemoryClient::new(me()));

    let result = processor(&client, StreamConfig::default())
        .start(vec![track()], CancellationToken::new())
        .await;
    assert!(matches!(result, Err(EngineError::Startup(_))));

    let result = processor(&client, StreamConfig::default())
        .run(vec![StreamFilter::default()], CancellationToken::new())
        .await;
    assert!(matches!(result, Err(EngineError::Startup(_))));
}
