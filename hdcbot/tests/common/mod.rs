#![allow(dead_code)]

use std::sync::Arc;

use hdcbot::{DispatchConfig, Dispatcher, FilterRule};
use interfaces::memory::{CallRecord, Op};
use interfaces::{Account, ActionKind, Item, MemoryClient};

pub const ME: u64 = 1;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn me() -> Account {
    Account::new(ME, "hdcbot").with_counts(500, 400)
}

pub fn account(id: u64, screen_name: &str, followers: u64, friends: u64) -> Account {
    Account::new(id, screen_name).with_counts(followers, friends)
}

pub fn item(id: u64, author: &Account, text: &str) -> Item {
    Item::new(id, author.clone(), text)
}

/// Dispatch settings without the pre-action jitter, so only the cool-down
/// moves the clock.
pub fn no_jitter(cooldown_minutes: u64) -> DispatchConfig {
    DispatchConfig {
        jitter: None,
        cooldown_minutes,
        ..Default::default()
    }
}

pub fn dispatcher(client: &Arc<MemoryClient>, config: DispatchConfig) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(client.clone(), config))
}

/// Look/block free rule that reacts to anyone with 100+ followers.
pub fn open_rule() -> FilterRule {
    FilterRule::default()
}

pub fn action_calls(calls: &[CallRecord], wanted: ActionKind) -> Vec<CallRecord> {
    calls
        .iter()
        .filter(|record| matches!(record.op, Op::Action(kind, _) if kind == wanted))
        .cloned()
        .collect()
}
