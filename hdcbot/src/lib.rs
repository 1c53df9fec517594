//! hdcbot: an autonomous engagement agent.
//!
//! Live items and paged account lists are funnelled through the filter
//! engine and the action dispatcher; the remote service itself is reached
//! only through [`interfaces::RemoteClient`].

pub mod agent;
pub mod config;
pub mod crawler;
pub mod dispatcher;
pub mod filter;
pub mod pages;
pub mod stream;
pub mod sweeper;
pub mod types;

pub use agent::Agent;
pub use config::{AgentConfig, CrawlConfig, CrawlSource, DispatchConfig, FilterRule, JitterWindow, StreamConfig};
pub use crawler::Crawler;
pub use dispatcher::{ActionLedger, Dispatcher};
pub use filter::{decide, Decision, Reactions, RejectReason};
pub use pages::AccountPages;
pub use stream::{StreamHandles, StreamListener, StreamProcessor, SubscriptionHandle, SubscriptionState};
pub use sweeper::Sweeper;
pub use types::*;
