#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use provision_backend::fakes::{MemoryArchiveStore, MemoryBackend, MemoryPool};
use provision_backend::PoolSettings;
use sbx_broker_core::{Broker, BrokerConfig, ManualClock, RunEvent, StreamItem, Subscription};

pub struct Harness {
    pub broker: Broker,
    pub backend: Arc<MemoryBackend>,
    pub pool: Arc<MemoryPool>,
    pub clock: Arc<ManualClock>,
}

/// Zero-delay defaults.
pub fn config() -> BrokerConfig {
    BrokerConfig::default().without_delays()
}

pub fn pooled_config() -> BrokerConfig {
    let mut cfg = config();
    cfg.pool = Some(PoolSettings::default());
    cfg
}

pub fn harness(config: BrokerConfig, archives: Option<MemoryArchiveStore>) -> Harness {
    let backend = Arc::new(MemoryBackend::new());
    let pool = Arc::new(MemoryPool::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));

    let mut builder = Broker::builder(config.clone(), backend.clone()).with_clock(clock.clone());
    if config.pool.is_some() {
        builder = builder.with_pool(pool.clone());
    }
    if let Some(store) = archives {
        builder = builder.with_archives(Arc::new(store));
    }
    Harness {
        broker: builder.build().unwrap(),
        backend,
        pool,
        clock,
    }
}

/// Read events until `stop` matches (inclusive) or the stream ends.
pub async fn read_until(
    events: &mut Subscription,
    stop: impl Fn(&RunEvent) -> bool,
) -> Vec<RunEvent> {
    let collect = async {
        let mut seen = Vec::new();
        while let Some(item) = events.next().await {
            if let StreamItem::Event(event) = item {
                let done = stop(&event);
                seen.push(event);
                if done {
                    break;
                }
            }
        }
        seen
    };
    tokio::time::timeout(Duration::from_secs(600), collect)
        .await
        .expect("stream stalled")
}

/// Events up to and including `ready` or `complete`.
pub async fn until_settled(events: &mut Subscription) -> Vec<RunEvent> {
    read_until(events, |e| matches!(e, RunEvent::Ready { .. } | RunEvent::Complete { .. })).await
}

/// Events up to the last line the provisioning task writes.
pub async fn until_finished(events: &mut Subscription) -> Vec<RunEvent> {
    read_until(events, |e| match e {
        RunEvent::Log { message, .. } => message.starts_with("Auto-cleanup in"),
        RunEvent::Complete { .. } => true,
        _ => false,
    })
    .await
}

pub fn messages(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Log { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

pub fn position(lines: &[String], needle: &str) -> usize {
    lines
        .iter()
        .position(|l| l.contains(needle))
        .unwrap_or_else(|| panic!("no line containing {:?} in {:#?}", needle, lines))
}

/// Poll `cond` until it holds, yielding to spawned tasks in between.
pub async fn eventually(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
