//! Ticket push channel multiplexing
//!
//! Keeps at most one socket per (project, ticket) key and fans every frame
//! out to all listeners registered for that key. The socket opens with the
//! first listener, closes with the last one, and reconnects with exponential
//! backoff while listeners remain.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use fleety_shared::{PushMessage, SubscriptionKey};

use crate::backoff::{BackoffPolicy, BackoffState};
use crate::timer::Timer;
use crate::transport::{SocketConnector, SocketLink};

/// Callback invoked for every frame on a channel
pub type Listener = Arc<dyn Fn(&PushMessage) + Send + Sync>;

/// Build a listener that hands frames to `handler` one at a time, in arrival
/// order, on a dedicated task.
///
/// Frames are queued without blocking delivery. The task drains what is
/// queued and exits once the listener is dropped. Must be called from within
/// a tokio runtime.
pub fn sequential<H, Fut>(mut handler: H) -> impl Fn(&PushMessage) + Send + Sync + 'static
where
    H: FnMut(PushMessage) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<PushMessage>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            handler(message).await;
        }
    });

    move |message: &PushMessage| {
        if tx.send(message.clone()).is_err() {
            tracing::trace!(kind = ?message.kind, "Frame handler already stopped");
        }
    }
}

/// Externally visible lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Open,
    /// Waiting out a backoff delay before the next attempt
    Reconnecting,
    /// Reconnect cap exceeded; the next subscribe starts over
    Abandoned,
}

enum ChannelPhase {
    Connecting,
    Open { outbound: mpsc::UnboundedSender<String> },
    Reconnecting,
    Abandoned,
}

impl ChannelPhase {
    fn status(&self) -> ChannelStatus {
        match self {
            ChannelPhase::Connecting => ChannelStatus::Connecting,
            ChannelPhase::Open { .. } => ChannelStatus::Open,
            ChannelPhase::Reconnecting => ChannelStatus::Reconnecting,
            ChannelPhase::Abandoned => ChannelStatus::Abandoned,
        }
    }
}

struct Channel {
    /// Distinguishes this channel from a later one under the same key
    generation: u64,
    listeners: Vec<(u64, Listener)>,
    phase: ChannelPhase,
    backoff: BackoffState,
    driver: Option<JoinHandle<()>>,
}

impl Channel {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            listeners: Vec::new(),
            phase: ChannelPhase::Connecting,
            backoff: BackoffState::new(),
            driver: None,
        }
    }

    fn close(self) {
        if let Some(driver) = self.driver {
            driver.abort();
        }
    }
}

#[derive(Default)]
struct MultiplexerState {
    channels: HashMap<SubscriptionKey, Channel>,
    next_listener_id: u64,
    next_generation: u64,
}

struct Inner {
    state: Mutex<MultiplexerState>,
    connector: Arc<dyn SocketConnector>,
    timer: Arc<dyn Timer>,
    policy: BackoffPolicy,
}

/// Statistics about open push channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiplexerStats {
    pub channels: usize,
    pub open_connections: usize,
    pub listeners: usize,
}

/// Shares one socket per ticket among any number of listeners
#[derive(Clone)]
pub struct ConnectionMultiplexer {
    inner: Arc<Inner>,
}

impl ConnectionMultiplexer {
    pub fn new(
        connector: Arc<dyn SocketConnector>,
        timer: Arc<dyn Timer>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MultiplexerState::default()),
                connector,
                timer,
                policy,
            }),
        }
    }

    /// Register a listener for a ticket channel.
    ///
    /// Opens the socket if no connection or attempt exists for the key;
    /// otherwise the listener attaches to the existing one. Must be called
    /// from within a tokio runtime.
    pub fn subscribe<F>(&self, key: SubscriptionKey, listener: F) -> Subscription
    where
        F: Fn(&PushMessage) + Send + Sync + 'static,
    {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        state.next_listener_id += 1;
        let id = state.next_listener_id;

        let channel = match state.channels.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                state.next_generation += 1;
                entry.insert(Channel::new(state.next_generation))
            }
        };
        channel.listeners.push((id, Arc::new(listener)));

        if channel.driver.is_none() {
            channel.phase = ChannelPhase::Connecting;
            channel.backoff.reset();
            channel.driver = Some(tokio::spawn(run_channel(
                Arc::downgrade(&self.inner),
                key.clone(),
                channel.generation,
            )));
            tracing::debug!(channel = %key, "Opening ticket channel");
        }

        tracing::debug!(
            channel = %key,
            listeners = channel.listeners.len(),
            "Listener joined ticket channel"
        );

        Subscription {
            key,
            id,
            inner: Arc::downgrade(&self.inner),
            active: true,
        }
    }

    /// Send a text frame on an open channel.
    ///
    /// Best-effort: returns false without queuing when the channel is not
    /// open.
    pub fn publish<T: Serialize>(&self, key: &SubscriptionKey, payload: &T) -> bool {
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(channel = %key, error = %e, "Failed to serialize outbound frame");
                return false;
            }
        };

        let state = self.inner.lock();
        match state.channels.get(key).map(|c| &c.phase) {
            Some(ChannelPhase::Open { outbound }) => outbound.send(text).is_ok(),
            _ => {
                tracing::debug!(channel = %key, "Dropping outbound frame, channel not open");
                false
            }
        }
    }

    /// Close every channel and drop every listener
    pub fn shutdown(&self) {
        let channels: Vec<Channel> = {
            let mut state = self.inner.lock();
            state.channels.drain().map(|(_, channel)| channel).collect()
        };
        let count = channels.len();
        for channel in channels {
            channel.close();
        }
        tracing::info!(channels = count, "Closed all ticket channels");
    }

    /// Get number of listeners registered for a channel
    pub fn get_listener_count(&self, key: &SubscriptionKey) -> usize {
        self.inner
            .lock()
            .channels
            .get(key)
            .map(|c| c.listeners.len())
            .unwrap_or(0)
    }

    /// Get total number of tracked channels
    pub fn get_channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }

    pub fn channel_status(&self, key: &SubscriptionKey) -> Option<ChannelStatus> {
        self.inner.lock().channels.get(key).map(|c| c.phase.status())
    }

    /// Reconnects scheduled since the channel last opened
    pub fn reconnect_attempts(&self, key: &SubscriptionKey) -> Option<u32> {
        self.inner
            .lock()
            .channels
            .get(key)
            .map(|c| c.backoff.attempts())
    }

    pub fn stats(&self) -> MultiplexerStats {
        let state = self.inner.lock();
        MultiplexerStats {
            channels: state.channels.len(),
            open_connections: state
                .channels
                .values()
                .filter(|c| matches!(c.phase, ChannelPhase::Open { .. }))
                .count(),
            listeners: state.channels.values().map(|c| c.listeners.len()).sum(),
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, MultiplexerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_listener(&self, key: &SubscriptionKey, id: u64) {
        let removed = {
            let mut state = self.lock();
            let Some(channel) = state.channels.get_mut(key) else {
                return;
            };
            channel.listeners.retain(|(listener_id, _)| *listener_id != id);
            if channel.listeners.is_empty() {
                state.channels.remove(key)
            } else {
                tracing::debug!(
                    channel = %key,
                    listeners = channel.listeners.len(),
                    "Listener left ticket channel"
                );
                None
            }
        };

        if let Some(channel) = removed {
            channel.close();
            tracing::debug!(channel = %key, "Last listener left, closed ticket channel");
        }
    }

    /// Record an open socket. Returns false if the channel went away meanwhile.
    fn mark_open(
        &self,
        key: &SubscriptionKey,
        generation: u64,
        outbound: mpsc::UnboundedSender<String>,
    ) -> bool {
        let mut state = self.lock();
        match state.channels.get_mut(key) {
            Some(channel) if channel.generation == generation && !channel.listeners.is_empty() => {
                channel.phase = ChannelPhase::Open { outbound };
                channel.backoff.reset();
                true
            }
            _ => false,
        }
    }

    fn deliver(&self, key: &SubscriptionKey, generation: u64, frame: &str) {
        let message = match PushMessage::parse(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(channel = %key, error = %e, "Error parsing WebSocket message");
                return;
            }
        };

        // Snapshot so listeners run without the lock held
        let listeners: Vec<Listener> = {
            let state = self.lock();
            match state.channels.get(key) {
                Some(channel) if channel.generation == generation => channel
                    .listeners
                    .iter()
                    .map(|(_, listener)| Arc::clone(listener))
                    .collect(),
                _ => return,
            }
        };

        for listener in &listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&message))).is_err() {
                tracing::warn!(
                    channel = %key,
                    kind = ?message.kind,
                    "Push listener panicked, continuing delivery"
                );
            }
        }
    }

    /// Decide what happens after a socket closed or failed to open.
    ///
    /// Returns the delay before the next attempt, or `None` when the driver
    /// should stop.
    fn schedule_reconnect(&self, key: &SubscriptionKey, generation: u64) -> Option<Duration> {
        let mut state = self.lock();
        let channel = match state.channels.get_mut(key) {
            Some(channel) if channel.generation == generation => channel,
            _ => return None,
        };

        if channel.listeners.is_empty() {
            if let Some(channel) = state.channels.remove(key) {
                channel.close();
            }
            return None;
        }

        match channel.backoff.record_failure(&self.policy) {
            Some(delay) => {
                channel.phase = ChannelPhase::Reconnecting;
                tracing::info!(
                    channel = %key,
                    delay_ms = delay.as_millis() as u64,
                    attempt = channel.backoff.attempts(),
                    max_attempts = self.policy.max_attempts,
                    "Reconnecting to ticket channel"
                );
                Some(delay)
            }
            None => {
                channel.phase = ChannelPhase::Abandoned;
                channel.backoff.reset();
                channel.driver = None;
                tracing::warn!(
                    channel = %key,
                    listeners = channel.listeners.len(),
                    "Max reconnection attempts reached"
                );
                None
            }
        }
    }

    /// Move a waiting channel back to connecting. False if it went away.
    fn begin_reconnect(&self, key: &SubscriptionKey, generation: u64) -> bool {
        let mut state = self.lock();
        match state.channels.get_mut(key) {
            Some(channel) if channel.generation == generation && !channel.listeners.is_empty() => {
                channel.phase = ChannelPhase::Connecting;
                true
            }
            _ => false,
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, channel) in state.channels.drain() {
            channel.close();
        }
    }
}

/// Connect, pump and reconnect one channel until its listeners are gone
async fn run_channel(inner: Weak<Inner>, key: SubscriptionKey, generation: u64) {
    loop {
        let Some(connector) = inner.upgrade().map(|i| Arc::clone(&i.connector)) else {
            return;
        };
        let result = connector.connect(&key).await;
        drop(connector);

        let Some(strong) = inner.upgrade() else {
            return;
        };
        match result {
            Ok(SocketLink {
                outbound,
                mut inbound,
            }) => {
                if !strong.mark_open(&key, generation, outbound) {
                    return;
                }
                drop(strong);
                tracing::info!(channel = %key, "WebSocket connected");

                while let Some(frame) = inbound.recv().await {
                    let Some(strong) = inner.upgrade() else {
                        return;
                    };
                    strong.deliver(&key, generation, &frame);
                }
                tracing::info!(channel = %key, "WebSocket closed");
            }
            Err(e) => {
                drop(strong);
                tracing::warn!(channel = %key, error = %e, "WebSocket connection failed");
            }
        }

        let Some(strong) = inner.upgrade() else {
            return;
        };
        let Some(delay) = strong.schedule_reconnect(&key, generation) else {
            return;
        };
        let timer = Arc::clone(&strong.timer);
        drop(strong);

        timer.sleep(delay).await;

        match inner.upgrade() {
            Some(strong) if strong.begin_reconnect(&key, generation) => {}
            _ => return,
        }
    }
}

/// Registration handle of one listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
    key: SubscriptionKey,
    id: u64,
    inner: Weak<Inner>,
    active: bool,
}

impl Subscription {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Remove the listener; closes the socket if it was the last one
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_listener(&self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;
    use async_trait::async_trait;
    use fleety_shared::PushKind;
    use serde_json::json;

    /// Records requested delays and returns immediately
    #[derive(Default)]
    struct RecordingTimer {
        delays: Mutex<Vec<Duration>>,
    }

    impl RecordingTimer {
        fn delays(&self) -> Vec<Duration> {
            self.delays.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Timer for RecordingTimer {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
            tokio::task::yield_now().await;
        }
    }

    fn setup(base_ms: u64, max_attempts: u32) -> (ConnectionMultiplexer, Arc<MemoryConnector>, Arc<RecordingTimer>) {
        let connector = Arc::new(MemoryConnector::new());
        let timer = Arc::new(RecordingTimer::default());
        let mux = ConnectionMultiplexer::new(
            connector.clone(),
            timer.clone(),
            BackoffPolicy::new(Duration::from_millis(base_ms), max_attempts),
        );
        (mux, connector, timer)
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn frame(kind: &str) -> String {
        json!({"type": kind, "payload": {}}).to_string()
    }

    fn key() -> SubscriptionKey {
        SubscriptionKey::new("proj_1", "abc-123")
    }

    #[tokio::test]
    async fn test_listeners_share_one_connection() {
        let (mux, connector, _timer) = setup(100, 5);

        let _a = mux.subscribe(key(), |_| {});
        let _b = mux.subscribe(key(), |_| {});
        settle().await;

        assert_eq!(connector.connect_count(&key()), 1);
        assert_eq!(connector.open_connections(&key()), 1);
        assert_eq!(mux.get_listener_count(&key()), 2);
        assert_eq!(mux.channel_status(&key()), Some(ChannelStatus::Open));

        let _c = mux.subscribe(key(), |_| {});
        settle().await;
        assert_eq!(connector.connect_count(&key()), 1);
    }

    #[tokio::test]
    async fn test_fan_out_in_registration_order() {
        let (mux, connector, _timer) = setup(100, 5);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        let _a = mux.subscribe(key(), move |m| log.lock().unwrap().push(("a", m.kind)));
        let log = seen.clone();
        let _b = mux.subscribe(key(), move |m| log.lock().unwrap().push(("b", m.kind)));
        settle().await;

        assert!(connector.push(&key(), frame("new_message")));
        settle().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("a", PushKind::NewMessage), ("b", PushKind::NewMessage)]
        );
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_block_others() {
        let (mux, connector, _timer) = setup(100, 5);
        let seen = Arc::new(Mutex::new(0));

        let _a = mux.subscribe(key(), |_| panic!("listener failure"));
        let count = seen.clone();
        let _b = mux.subscribe(key(), move |_| *count.lock().unwrap() += 1);
        settle().await;

        connector.push(&key(), frame("status_change"));
        connector.push(&key(), frame("status_change"));
        settle().await;

        assert_eq!(*seen.lock().unwrap(), 2);
        assert_eq!(mux.channel_status(&key()), Some(ChannelStatus::Open));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let (mux, connector, _timer) = setup(100, 5);
        let seen = Arc::new(Mutex::new(0));

        let count = seen.clone();
        let _a = mux.subscribe(key(), move |_| *count.lock().unwrap() += 1);
        settle().await;

        connector.push(&key(), "not json");
        connector.push(&key(), frame("subscribed"));
        settle().await;

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_last_unsubscribe_closes_and_purges() {
        let (mux, connector, timer) = setup(100, 5);

        let a = mux.subscribe(key(), |_| {});
        let b = mux.subscribe(key(), |_| {});
        settle().await;

        a.unsubscribe();
        assert_eq!(mux.get_listener_count(&key()), 1);
        assert_eq!(mux.get_channel_count(), 1);

        drop(b);
        assert_eq!(mux.get_channel_count(), 0);
        settle().await;

        assert_eq!(connector.open_connections(&key()), 0);
        assert_eq!(connector.connect_count(&key()), 1);
        assert!(timer.delays().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_during_reconnect_wait_cancels_it() {
        let (mux, connector, _timer) = setup(100, 30);
        connector.refuse_all(true);

        let sub = mux.subscribe(key(), |_| {});
        settle().await;
        let attempts = connector.connect_count(&key());
        assert!(attempts >= 1);

        drop(sub);
        settle().await;
        let after = connector.connect_count(&key());
        settle().await;

        assert_eq!(connector.connect_count(&key()), after);
        assert_eq!(mux.get_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_delays_double_until_cap() {
        let (mux, connector, timer) = setup(100, 3);
        connector.refuse_all(true);

        let _sub = mux.subscribe(key(), |_| {});
        settle().await;

        assert_eq!(
            timer.delays(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ]
        );
        assert_eq!(connector.connect_count(&key()), 4);
        assert_eq!(mux.channel_status(&key()), Some(ChannelStatus::Abandoned));
        // Listeners stay registered after giving up
        assert_eq!(mux.get_listener_count(&key()), 1);
    }

    #[tokio::test]
    async fn test_subscribe_after_abandon_restarts_channel() {
        let (mux, connector, _timer) = setup(100, 1);
        connector.refuse_all(true);

        let _a = mux.subscribe(key(), |_| {});
        settle().await;
        assert_eq!(mux.channel_status(&key()), Some(ChannelStatus::Abandoned));

        connector.refuse_all(false);
        let _b = mux.subscribe(key(), |_| {});
        settle().await;

        assert_eq!(mux.channel_status(&key()), Some(ChannelStatus::Open));
        assert_eq!(mux.get_listener_count(&key()), 2);
    }

    #[tokio::test]
    async fn test_attempts_reset_after_open() {
        let (mux, connector, timer) = setup(100, 5);
        connector.refuse_next(2);

        let _sub = mux.subscribe(key(), |_| {});
        settle().await;

        assert_eq!(mux.channel_status(&key()), Some(ChannelStatus::Open));
        assert_eq!(mux.reconnect_attempts(&key()), Some(0));
        assert_eq!(
            timer.delays(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );

        // Server drops the socket: backoff starts again from the base delay
        connector.disconnect(&key());
        settle().await;

        assert_eq!(mux.channel_status(&key()), Some(ChannelStatus::Open));
        assert_eq!(timer.delays().last(), Some(&Duration::from_millis(100)));
        assert_eq!(connector.connect_count(&key()), 4);
        assert_eq!(connector.open_connections(&key()), 1);
    }

    #[tokio::test]
    async fn test_publish_only_when_open() {
        let (mux, connector, _timer) = setup(100, 5);

        let _sub = mux.subscribe(key(), |_| {});
        assert!(!mux.publish(&key(), &json!({"type": "ping"})));

        settle().await;
        assert!(mux.publish(&key(), &json!({"type": "ping"})));
        assert_eq!(connector.received(&key()), vec![r#"{"type":"ping"}"#.to_string()]);

        let other = SubscriptionKey::new("proj_1", "other");
        assert!(!mux.publish(&other, &json!({"type": "ping"})));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (mux, connector, _timer) = setup(100, 5);
        let other = SubscriptionKey::new("proj_2", "abc-123");

        let _a = mux.subscribe(key(), |_| {});
        let _b = mux.subscribe(other.clone(), |_| {});
        settle().await;

        assert_eq!(mux.stats(), MultiplexerStats { channels: 2, open_connections: 2, listeners: 2 });
        assert_eq!(connector.connect_count(&other), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sequential_listener_keeps_arrival_order() {
        let (mux, connector, _timer) = setup(100, 5);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        let _sub = mux.subscribe(
            key(),
            sequential(move |message: PushMessage| {
                let log = log.clone();
                async move {
                    let n = message.payload["n"].as_u64().unwrap();
                    // Earlier frames take longer, so any overlap would reorder them
                    tokio::time::sleep(Duration::from_millis(20 - n)).await;
                    log.lock().unwrap().push(n);
                }
            }),
        );
        for _ in 0..200 {
            if mux.channel_status(&key()) == Some(ChannelStatus::Open) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for n in 0..10u64 {
            let frame = json!({"type": "ticket_update", "payload": {"n": n}});
            assert!(connector.push(&key(), frame.to_string()));
        }
        for _ in 0..200 {
            if seen.lock().unwrap().len() == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let (mux, connector, _timer) = setup(100, 5);

        let sub = mux.subscribe(key(), |_| {});
        settle().await;

        mux.shutdown();
        settle().await;

        assert_eq!(mux.get_channel_count(), 0);
        assert_eq!(connector.open_connections(&key()), 0);

        // A late unsubscribe on a cleared channel is harmless
        drop(sub);
        assert_eq!(mux.get_channel_count(), 0);
    }
}
