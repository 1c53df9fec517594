//! Pure accept/reject decisions for incoming items and follow candidates.
//!
//! Nothing here touches the network or keeps state: the same item and rule
//! always produce the same decision.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::FilterRule;
use crate::types::{Account, Item};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Sensitive,
    Reply,
    NoLookMatch,
    Blocked(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sensitive => f.write_str("possibly sensitive"),
            Self::Reply => f.write_str("reply to another account"),
            Self::NoLookMatch => f.write_str("no look term matched"),
            Self::Blocked(term) => write!(f, "blocked term '{}'", term),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Reject(RejectReason),
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Which reactions an accepted item qualifies for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reactions {
    pub retweet: bool,
    pub favorite: bool,
}

impl Reactions {
    pub fn any(&self) -> bool {
        self.retweet || self.favorite
    }
}

/// Split on line breaks, then whitespace, and case-fold.
pub fn tokenize(text: &str) -> Vec<String> {
    text.lines()
        .flat_map(str::split_whitespace)
        .map(str::to_lowercase)
        .collect()
}

fn first_match<'a>(terms: &'a [String], tokens: &[String]) -> Option<&'a String> {
    terms
        .iter()
        .find(|term| tokens.iter().any(|token| *token == term.to_lowercase()))
}

pub fn decide(item: &Item, rule: &FilterRule) -> Decision {
    if item.is_sensitive() {
        return Decision::Reject(RejectReason::Sensitive);
    }
    if item.is_reply() {
        return Decision::Reject(RejectReason::Reply);
    }

    let tokens = tokenize(&item.text);

    if !rule.look.is_empty() && first_match(&rule.look, &tokens).is_none() {
        return Decision::Reject(RejectReason::NoLookMatch);
    }
    if let Some(term) = first_match(&rule.block, &tokens) {
        return Decision::Reject(RejectReason::Blocked(term.clone()));
    }

    Decision::Accept
}

/// Numeric gates applied to an item that `decide` accepted.
pub fn reactions(item: &Item, rule: &FilterRule) -> Reactions {
    if item.author.followers_count < rule.min_followers {
        return Reactions::default();
    }
    Reactions {
        retweet: !item.retweeted && !item.is_retweet() && item.retweet_count >= rule.min_retweets,
        favorite: !item.favorited,
    }
}

/// Follower/following ratio guard against follow-for-follow accounts.
pub fn passes_ratio(account: &Account, rule: &FilterRule) -> bool {
    account.followers_count >= rule.min_followers
        && account.followers_count.saturating_add(rule.follower_margin) > account.friends_count
}

pub fn eligible_to_follow(account: &Account, rule: &FilterRule) -> bool {
    !account.following && passes_ratio(account, rule)
}
