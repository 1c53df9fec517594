//! Shared definitions for the engagement bot: the data model handed between
//! components and the [`RemoteClient`] collaborator the engine drives.

pub mod defs;
pub mod memory;

pub use defs::{
    codes, Account, AccountId, AccountKey, ActionKind, Concern, Item, ItemId, Page, Relationship,
    RemoteClient, RemoteError, RemoteResult, StreamEvent, StreamFilter, Subscription,
};
pub use memory::{MemoryClient, ScriptedEvent, ScriptedSession, ScriptedStream, Snapshot};
