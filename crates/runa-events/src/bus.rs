// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll, Waker};

use futures::Stream;
use tracing::warn;

use crate::event::{AgentEvent, Channel, EventEnvelope};

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

const APPEND_RETRIES: u32 = 3;

/// Durable destination for event envelopes.  The store implements this; the
/// bus never broadcasts an event that was not persisted first.
pub trait EventSink: Send + Sync {
    fn append_event(&self, envelope: &EventEnvelope) -> anyhow::Result<()>;

    /// Read back envelopes for replay.  `channels = None` means all
    /// channels; results are ordered by `seq`.
    fn read_back(
        &self,
        agent_id: &str,
        channels: Option<&[Channel]>,
        since: Option<u64>,
    ) -> anyhow::Result<Vec<EventEnvelope>>;
}

/// In-memory sink for unit tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<EventEnvelope>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for MemorySink {
    fn append_event(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(envelope.clone());
        Ok(())
    }

    fn read_back(
        &self,
        agent_id: &str,
        channels: Option<&[Channel]>,
        since: Option<u64>,
    ) -> anyhow::Result<Vec<EventEnvelope>> {
        let mut out: Vec<EventEnvelope> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .filter(|e| channels.map(|cs| cs.contains(&e.channel)).unwrap_or(true))
            .filter(|e| since.map(|s| e.seq > s).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.seq);
        Ok(out)
    }
}

struct Subscriber {
    channels: Vec<Channel>,
    queue: Mutex<VecDeque<EventEnvelope>>,
    capacity: usize,
    waker: Mutex<Option<Waker>>,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Subscriber {
    /// Push an envelope, dropping the oldest entry on overflow.  Returns the
    /// number of entries dropped by this push.
    fn push(&self, envelope: EventEnvelope) -> u64 {
        let mut queue = self.queue.lock().unwrap();
        let mut dropped = 0;
        while queue.len() >= self.capacity {
            queue.pop_front();
            dropped += 1;
        }
        queue.push_back(envelope);
        drop(queue);
        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
        }
        self.wake();
        dropped
    }

    fn pop(&self) -> Option<EventEnvelope> {
        self.queue.lock().unwrap().pop_front()
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.lock().unwrap().take() {
            waker.wake();
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Per-agent event fan-out with durable write-ahead logging.
///
/// Every emission is appended to the sink first, then broadcast to live
/// subscribers.  The slowest consumer never blocks the publisher: each
/// subscriber owns a bounded queue and overflow drops the oldest entries,
/// recorded by a `monitor: subscriber_lag` event.
pub struct EventBus {
    agent_id: String,
    sink: Arc<dyn EventSink>,
    seq: AtomicU64,
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
}

impl EventBus {
    pub fn new(agent_id: impl Into<String>, sink: Arc<dyn EventSink>, start_seq: u64) -> Self {
        Self {
            agent_id: agent_id.into(),
            sink,
            seq: AtomicU64::new(start_seq),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// The last sequence number handed out — the replay bookmark.
    pub fn bookmark(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Append to the durable log, then broadcast.  Returns the assigned
    /// sequence number.
    ///
    /// Persistence failures are retried a few times; if the sink still
    /// refuses, the error propagates so the orchestrator can halt the turn
    /// rather than continue with an unlogged event.
    pub fn emit(&self, event: AgentEvent) -> anyhow::Result<u64> {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let envelope = EventEnvelope {
            seq,
            agent_id: self.agent_id.clone(),
            channel: event.channel(),
            timestamp: chrono::Utc::now(),
            event,
        };

        let mut last_err = None;
        for attempt in 0..APPEND_RETRIES {
            match self.sink.append_event(&envelope) {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "event append failed");
                    last_err = Some(e);
                }
            }
        }
        if let Some(e) = last_err {
            return Err(e.context("event log append failed after retries"));
        }

        self.fan_out(envelope);
        Ok(seq)
    }

    fn fan_out(&self, envelope: EventEnvelope) {
        // Copy-on-write read of the subscriber list; pruning of closed
        // subscribers happens lazily on the next subscribe/unsubscribe.
        let subscribers = self.subscribers.read().unwrap().clone();
        let is_lag_event = matches!(envelope.event, AgentEvent::SubscriberLag { .. });
        let mut lagged = 0u64;
        for sub in &subscribers {
            if sub.is_closed() || !sub.channels.contains(&envelope.channel) {
                continue;
            }
            lagged += sub.push(envelope.clone());
        }
        // Record the drop durably, but never recurse on the lag event
        // itself.
        if lagged > 0 && !is_lag_event {
            if let Err(e) = self.emit(AgentEvent::SubscriberLag { dropped: lagged }) {
                warn!(error = %e, "failed to record subscriber lag");
            }
        }
    }

    fn prune(&self) {
        self.subscribers
            .write()
            .unwrap()
            .retain(|s| !s.is_closed());
    }

    /// Subscribe to one or more channels.
    ///
    /// With `since`, the durable log is replayed from `since + 1` before
    /// live tailing begins; events emitted while the replay is read are
    /// de-duplicated by sequence number, so the stream is gap-free and
    /// duplicate-free.  Without `since`, only future events are delivered.
    pub fn subscribe(&self, channels: &[Channel], since: Option<u64>) -> Subscription {
        self.subscribe_with_capacity(channels, since, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(
        &self,
        channels: &[Channel],
        since: Option<u64>,
        capacity: usize,
    ) -> Subscription {
        self.prune();
        let subscriber = Arc::new(Subscriber {
            channels: channels.to_vec(),
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            waker: Mutex::new(None),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        // Register before reading the log so nothing emitted in between is
        // missed; overlap is filtered by the cutoff below.
        self.subscribers.write().unwrap().push(Arc::clone(&subscriber));

        let (replayed, cutoff) = match since {
            Some(since) => {
                let replayed = self
                    .sink
                    .read_back(&self.agent_id, Some(channels), Some(since))
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "event replay failed; starting live-only");
                        Vec::new()
                    });
                let cutoff = replayed.last().map(|e| e.seq).unwrap_or(since);
                (VecDeque::from(replayed), cutoff)
            }
            // Live-only: everything already queued is fair game.
            None => (VecDeque::new(), 0),
        };

        Subscription {
            replayed,
            cutoff: if since.is_some() { Some(cutoff) } else { None },
            subscriber,
        }
    }

    /// Sugar: subscribe to monitor + control, filter by event type, invoke
    /// `handler` for each match.  Dropping the returned guard unsubscribes.
    pub fn on(
        &self,
        event_type: &str,
        handler: impl Fn(EventEnvelope) + Send + Sync + 'static,
    ) -> OnGuard {
        let mut subscription = self.subscribe(&[Channel::Monitor, Channel::Control], None);
        let event_type = event_type.to_string();
        let subscriber = Arc::clone(&subscription.subscriber);
        let task = tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(envelope) = subscription.next().await {
                if envelope.event.type_name() == event_type {
                    handler(envelope);
                }
            }
        });
        OnGuard {
            subscriber,
            task: Some(task),
        }
    }
}

/// Live handle returned by [`EventBus::on`]; drop (or call
/// [`OnGuard::unsubscribe`]) to detach the handler.
pub struct OnGuard {
    subscriber: Arc<Subscriber>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl OnGuard {
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        self.subscriber.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for OnGuard {
    fn drop(&mut self) {
        self.detach();
    }
}

/// An async sequence of [`EventEnvelope`]s: replayed history first, then
/// live tail.  Dropping the subscription unsubscribes.
pub struct Subscription {
    replayed: VecDeque<EventEnvelope>,
    /// Replay/live boundary: live envelopes with `seq <= cutoff` were
    /// already served from the replay and are skipped.
    cutoff: Option<u64>,
    subscriber: Arc<Subscriber>,
}

impl Subscription {
    /// Total events dropped from this subscriber's queue due to lag.
    pub fn dropped(&self) -> u64 {
        self.subscriber.dropped.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.subscriber.close();
    }
}

impl Stream for Subscription {
    type Item = EventEnvelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(envelope) = self.replayed.pop_front() {
            return Poll::Ready(Some(envelope));
        }
        loop {
            if let Some(envelope) = self.subscriber.pop() {
                if let Some(cutoff) = self.cutoff {
                    if envelope.seq <= cutoff {
                        continue;
                    }
                }
                return Poll::Ready(Some(envelope));
            }
            if self.subscriber.is_closed() {
                return Poll::Ready(None);
            }
            // Park the waker, then re-check the queue to close the race
            // between the empty check and a concurrent push.
            *self.subscriber.waker.lock().unwrap() = Some(cx.waker().clone());
            if self.subscriber.queue.lock().unwrap().is_empty() && !self.subscriber.is_closed() {
                return Poll::Pending;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscriber.close();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
