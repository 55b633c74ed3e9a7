mod phoenix;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::FeedResult;

pub use phoenix::RealtimeChannel;

/// Tables whose row changes invalidate the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedTable {
    Posts,
    Comments,
    Reactions,
}

impl FeedTable {
    pub const ALL: [FeedTable; 3] = [FeedTable::Posts, FeedTable::Comments, FeedTable::Reactions];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedTable::Posts => "posts",
            FeedTable::Comments => "comments",
            FeedTable::Reactions => "reactions",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|table| table.as_str() == name)
    }
}

impl fmt::Display for FeedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// "Something changed" on a watched table. No row payload is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table: FeedTable,
    pub kind: ChangeKind,
}

/// A live subscription. `next()` yielding `None` means the channel
/// disconnected and the caller has to subscribe again.
pub struct Subscription {
    events: mpsc::Receiver<ChangeEvent>,
    closer: CancellationToken,
}

impl Subscription {
    /// Wraps a receiver; `closer` is cancelled when the subscription is dropped
    /// so the transport can release its connection.
    pub fn new(events: mpsc::Receiver<ChangeEvent>, closer: CancellationToken) -> Self {
        Self { events, closer }
    }

    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Discards events that are already queued and returns how many there were.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.events.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.closer.cancel();
    }
}

/// Push-based change notification keyed by table name.
#[async_trait]
pub trait ChangeChannel: Send + Sync {
    async fn subscribe(
        &self,
        tables: &[FeedTable],
        access_token: Option<String>,
    ) -> FeedResult<Subscription>;
}
