//! Per-run event channel.
//!
//! An ordered, unbounded relay from the run's provisioning task to any
//! number of independent subscribers. Each subscriber owns its queue, so a
//! slow reader never holds up the producer or another reader. The channel
//! does not buffer history itself: replay comes from the run's log lines and
//! is handed in by the registry when a subscriber attaches.

use std::collections::VecDeque;
use std::time::Duration;

use futures::stream::{self, Stream};
use tokio::sync::mpsc;

use crate::domain::{RunEvent, RunId, StreamItem};

#[derive(Debug, Default)]
pub struct EventChannel {
    subscribers: Vec<mpsc::UnboundedSender<RunEvent>>,
    closed: bool,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay `event` to every live subscriber; returns how many received it.
    /// A no-op once the channel is closed.
    pub fn emit(&mut self, event: &RunEvent) -> usize {
        if self.closed {
            return 0;
        }
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
        self.subscribers.len()
    }

    /// Register a subscriber that first yields `replay`, then live events.
    pub fn attach(
        &mut self,
        run_id: RunId,
        replay: Vec<RunEvent>,
        keepalive: Duration,
    ) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.closed {
            self.subscribers.push(tx);
        }
        Subscription {
            run_id,
            replay: replay.into(),
            rx,
            keepalive,
        }
    }

    /// End every subscription once its queue drains.
    pub fn close(&mut self) {
        self.closed = true;
        self.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// One subscriber's view of a run: replay, then live relay with keepalives.
///
/// Ends when the run is deleted; dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    run_id: RunId,
    replay: VecDeque<RunEvent>,
    rx: mpsc::UnboundedReceiver<RunEvent>,
    keepalive: Duration,
}

impl Subscription {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Next item; `None` once the channel is closed and drained.
    pub async fn next(&mut self) -> Option<StreamItem> {
        if let Some(event) = self.replay.pop_front() {
            return Some(StreamItem::Event(event));
        }
        match tokio::time::timeout(self.keepalive, self.rx.recv()).await {
            Ok(Some(event)) => Some(StreamItem::Event(event)),
            Ok(None) => None,
            Err(_) => Some(StreamItem::Keepalive),
        }
    }

    /// Collect events until the stream ends, skipping keepalives.
    pub async fn collect_events(mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(item) = self.next().await {
            if let StreamItem::Event(event) = item {
                events.push(event);
            }
        }
        events
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamItem> + Send {
        stream::unfold(self, |mut sub| async move {
            let item = sub.next().await?;
            Some((item, sub))
        })
    }
}
