// =============================================================================
// Notifier — in-process event bus with per-channel serial delivery
// =============================================================================
//
// Each chat channel owns a bounded FIFO (drop-oldest on overflow, with one
// synthetic NotifierOverflow event) and a dedicated worker task, so a slow
// channel can never block another. Delivery is token-bucket rate limited
// (wait-then-send); when the bucket would make a message wait beyond the
// coalesce threshold, queued events of the same class are merged into one.
//
// Channel roles: exactly one admin channel receives everything including
// command acknowledgements; notify-only channels receive analysis and trade
// events only.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{Event, EventClass};
use crate::telegram::{format_event, ChatTransport};

/// Deadline for one chat send.
const CHAT_SEND_DEADLINE: Duration = Duration::from_secs(10);

/// Bucket waits longer than this trigger same-class coalescing.
const COALESCE_THRESHOLD: Duration = Duration::from_secs(5);

/// Role of a chat channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Admin,
    NotifyOnly,
}

impl ChannelRole {
    fn accepts(&self, class: EventClass) -> bool {
        match self {
            Self::Admin => true,
            Self::NotifyOnly => matches!(class, EventClass::Analysis | EventClass::Trade),
        }
    }
}

/// Static description of one channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub name: String,
    pub chat_id: i64,
    pub role: ChannelRole,
}

// ---------------------------------------------------------------------------
// Channel queue
// ---------------------------------------------------------------------------

struct ChannelQueue {
    name: String,
    chat_id: i64,
    role: ChannelRole,
    cap: usize,
    queue: Mutex<VecDeque<Event>>,
    wakeup: Notify,
}

impl ChannelQueue {
    fn new(config: &ChannelConfig, cap: usize) -> Self {
        Self {
            name: config.name.clone(),
            chat_id: config.chat_id,
            role: config.role,
            cap,
            queue: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
        }
    }

    /// Enqueue with drop-oldest overflow. The synthetic overflow marker is
    /// coalesced in place so a storm cannot flood the queue with markers,
    /// and the queue never holds more than `cap` events.
    fn enqueue(&self, event: Event) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.cap {
            queue.pop_front();
            let existing_marker = queue.iter_mut().find_map(|e| match e {
                Event::NotifierOverflow { dropped, .. } => Some(dropped),
                _ => None,
            });
            match existing_marker {
                Some(dropped) => *dropped += 1,
                None => {
                    // Make room so marker + event still fit under the cap.
                    if queue.len() + 1 >= self.cap {
                        queue.pop_front();
                    }
                    queue.push_back(Event::NotifierOverflow {
                        channel: self.name.clone(),
                        dropped: 1,
                    });
                }
            }
            warn!(channel = %self.name, "channel queue overflow, oldest event dropped");
        }
        queue.push_back(event);
        drop(queue);
        self.wakeup.notify_one();
    }

    fn pop(&self) -> Option<Event> {
        self.queue.lock().pop_front()
    }

    /// Remove every queued event of `class`, returning the newest one and
    /// how many were removed.
    fn drain_class(&self, class: EventClass) -> (Option<Event>, u32) {
        let mut queue = self.queue.lock();
        let mut newest = None;
        let mut removed = 0u32;
        let mut keep = VecDeque::with_capacity(queue.len());
        while let Some(event) = queue.pop_front() {
            if event.class() == class {
                newest = Some(event);
                removed += 1;
            } else {
                keep.push_back(event);
            }
        }
        *queue = keep;
        (newest, removed)
    }

    fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

/// Continuous-refill token bucket, one token per message.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32, now: Instant) -> Self {
        let capacity = per_minute.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + dt * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// How long until one token is available (zero when one is ready now).
    fn required_wait(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        }
    }

    /// Consume one token; the caller must have waited out `required_wait`.
    fn take(&mut self, now: Instant) {
        self.refill(now);
        self.tokens = (self.tokens - 1.0).max(0.0);
    }
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Cheap-to-clone publish handle shared by every producer.
#[derive(Clone)]
pub struct EventBus {
    channels: Arc<Vec<Arc<ChannelQueue>>>,
}

impl EventBus {
    /// Fan the event out to every channel whose role accepts its class.
    pub fn publish(&self, event: Event) {
        debug!(event = event.label(), "event published");
        for channel in self.channels.iter() {
            if channel.role.accepts(event.class()) {
                channel.enqueue(event.clone());
            }
        }
    }

    fn all_empty(&self) -> bool {
        self.channels.iter().all(|c| c.is_empty())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("channels", &self.channels.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Owns the channel workers; created once at startup.
pub struct Notifier {
    bus: EventBus,
    workers: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Notifier {
    /// Start one worker per channel.
    pub fn start(
        channels: &[ChannelConfig],
        transport: Arc<dyn ChatTransport>,
        rate_per_minute: u32,
        queue_cap: usize,
    ) -> Self {
        let queues: Vec<Arc<ChannelQueue>> = channels
            .iter()
            .map(|c| Arc::new(ChannelQueue::new(c, queue_cap)))
            .collect();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::with_capacity(queues.len());
        for queue in &queues {
            workers.push(tokio::spawn(run_channel(
                queue.clone(),
                transport.clone(),
                rate_per_minute,
                shutdown_rx.clone(),
            )));
        }

        info!(channels = queues.len(), rate_per_minute, "notifier started");
        Self {
            bus: EventBus {
                channels: Arc::new(queues),
            },
            workers,
            shutdown_tx,
        }
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Flush queues up to `grace`, then drop whatever remains.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);

        let deadline = Instant::now() + grace;
        while !self.bus.all_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !self.bus.all_empty() {
            warn!("notifier grace deadline hit, dropping undelivered events");
        }
        for worker in self.workers {
            worker.abort();
        }
        info!("notifier stopped");
    }
}

/// Per-channel delivery loop: strictly serial, rate limited, coalescing.
async fn run_channel(
    queue: Arc<ChannelQueue>,
    transport: Arc<dyn ChatTransport>,
    rate_per_minute: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut bucket = TokenBucket::new(rate_per_minute, Instant::now());

    loop {
        let Some(mut event) = queue.pop() else {
            if *shutdown.borrow() {
                break; // Drained while draining: this worker is done.
            }
            tokio::select! {
                _ = queue.wakeup.notified() => {}
                changed = shutdown.changed() => {
                    // A closed sender means the notifier was dropped.
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        };

        let mut coalesced = 1u32;
        let wait = bucket.required_wait(Instant::now());
        if wait > COALESCE_THRESHOLD {
            // The bucket has been empty for a while: keep this message and
            // merge everything of the same class behind it.
            let (newest, removed) = queue.drain_class(event.class());
            if let Some(newest) = newest {
                event = newest;
                coalesced += removed;
            }
        }
        if wait > Duration::ZERO {
            tokio::time::sleep(wait).await;
        }
        bucket.take(Instant::now());

        let mut text = format_event(&event);
        if coalesced > 1 {
            text.push_str(&format!("\n(x{coalesced} {} updates)", event.label()));
        }

        let send = transport.send(queue.chat_id, text);
        match tokio::time::timeout(CHAT_SEND_DEADLINE, send).await {
            Ok(Ok(())) => debug!(channel = %queue.name, "event delivered"),
            Ok(Err(e)) => warn!(channel = %queue.name, error = %e, "chat send failed"),
            Err(_) => warn!(channel = %queue.name, "chat send timed out"),
        }
    }
}
