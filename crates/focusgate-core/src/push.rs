//! Inbound push channel carrying user-activity updates and refresh signals.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::{
    remote::PolicySource,
    store::{ConfigurationStore, UserState},
};

type PushSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Silence after which the channel is pinged, and then given up on.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
pub struct ActiveUser {
    pub name: String,
    #[serde(default)]
    pub active: bool,
}

/// Messages the server pushes, tagged by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushEnvelope {
    Update {
        #[serde(default)]
        active_users: Option<Vec<ActiveUser>>,
    },
    Refresh,
    Configuracion,
    #[serde(other)]
    Other,
}

/// What a single inbound frame did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Our user was listed; carries the new `active` value.
    UserUpdated(bool),
    UserNotListed,
    PolicyRefreshed,
    /// The refresh fetch failed and the last known policy was kept.
    RefreshFailed,
    Ignored,
    Malformed,
}

/// Exponential reconnect delay, doubling from `min` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

enum Flow {
    Reconnect,
    Shutdown,
}

enum Event {
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Idle,
    Shutdown,
}

/// Long-lived client of `<push-endpoint>/<identity>/<client>`.
///
/// Runs until the shutdown channel fires. Losing the connection only moves it
/// to the reconnect state; it never affects the enforcement loop. A channel
/// that stays silent for one keepalive period is pinged, and one that is still
/// silent a period later is treated as lost.
pub struct PushListener<S: PolicySource> {
    url: String,
    source: Arc<S>,
    store: Arc<ConfigurationStore>,
    user: Arc<UserState>,
    backoff: Backoff,
    keepalive: Duration,
}

impl<S: PolicySource> PushListener<S> {
    pub fn new(
        url: impl Into<String>,
        source: Arc<S>,
        store: Arc<ConfigurationStore>,
        user: Arc<UserState>,
        backoff: Backoff,
    ) -> Self {
        Self {
            url: url.into(),
            source,
            store,
            user,
            backoff,
            keepalive: DEFAULT_KEEPALIVE,
        }
    }

    #[must_use]
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Apply one text frame to the shared state.
    pub async fn handle_message(&self, text: &str) -> Dispatch {
        let envelope: PushEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Ignoring undecodable push frame: {e}");
                return Dispatch::Malformed;
            }
        };

        match envelope {
            PushEnvelope::Update { active_users } => {
                let listed = active_users
                    .unwrap_or_default()
                    .into_iter()
                    .find(|entry| entry.name == self.user.identity());
                match listed {
                    Some(entry) => {
                        let previous = self.user.set_active(entry.active);
                        if previous != entry.active {
                            log::info!(
                                "User {} is now {}",
                                self.user.identity(),
                                if entry.active { "active" } else { "inactive" }
                            );
                        }
                        Dispatch::UserUpdated(entry.active)
                    }
                    None => Dispatch::UserNotListed,
                }
            }
            PushEnvelope::Refresh | PushEnvelope::Configuracion => {
                match self.source.fetch_policy().await {
                    Ok(policy) => {
                        self.store.set(policy);
                        Dispatch::PolicyRefreshed
                    }
                    Err(e) => {
                        log::warn!("Policy refresh failed, keeping the last one: {e:#}");
                        Dispatch::RefreshFailed
                    }
                }
            }
            PushEnvelope::Other => {
                log::debug!("Ignoring push message: {text}");
                Dispatch::Ignored
            }
        }
    }

    /// Connect, consume frames and reconnect until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            log::debug!("Connecting to push channel {}", self.url);
            let attempt = tokio::select! {
                result = connect_async(self.url.as_str()) => Some(result),
                _ = shutdown.changed() => None,
            };
            match attempt {
                None => break,
                Some(Ok((socket, _))) => {
                    log::info!("Push channel connected");
                    self.backoff.reset();
                    if let Flow::Shutdown = self.pump(socket, &mut shutdown).await {
                        break;
                    }
                }
                Some(Err(e)) => log::warn!("Push channel connection failed: {e}"),
            }

            let delay = self.backoff.next_delay();
            log::debug!("Reconnecting to push channel in {delay:?}");
            let stopped = tokio::select! {
                () = tokio::time::sleep(delay) => false,
                _ = shutdown.changed() => true,
            };
            if stopped {
                break;
            }
        }
        log::info!("Push listener stopped");
    }

    async fn pump(&self, mut socket: PushSocket, shutdown: &mut watch::Receiver<bool>) -> Flow {
        let mut awaiting_pong = false;
        loop {
            let event = tokio::select! {
                frame = socket.next() => Event::Frame(frame),
                () = tokio::time::sleep(self.keepalive) => Event::Idle,
                _ = shutdown.changed() => Event::Shutdown,
            };

            match event {
                Event::Shutdown => {
                    if let Err(e) = socket.close(None).await {
                        log::debug!("Closing push channel failed: {e}");
                    }
                    return Flow::Shutdown;
                }
                Event::Idle if awaiting_pong => {
                    log::warn!("Push channel silent for {:?}, reconnecting", self.keepalive * 2);
                    return Flow::Reconnect;
                }
                Event::Idle => {
                    if !self.ping(&mut socket).await {
                        return Flow::Reconnect;
                    }
                    awaiting_pong = true;
                }
                Event::Frame(Some(Ok(Message::Text(text)))) => {
                    awaiting_pong = false;
                    let outcome = self.handle_message(&text).await;
                    log::debug!("Push frame handled: {outcome:?}");
                }
                Event::Frame(Some(Ok(Message::Close(_))) | None) => {
                    log::warn!("Push channel closed by server");
                    return Flow::Reconnect;
                }
                Event::Frame(Some(Ok(_))) => awaiting_pong = false,
                Event::Frame(Some(Err(e))) => {
                    log::warn!("Push channel error: {e}");
                    return Flow::Reconnect;
                }
            }
        }
    }

    async fn ping(&self, socket: &mut PushSocket) -> bool {
        match tokio::time::timeout(self.keepalive, socket.send(Message::Ping(Vec::new()))).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::warn!("Push channel keepalive failed: {e}");
                false
            }
            Err(_) => {
                log::warn!("Push channel keepalive timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PolicyConfig;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    struct MockSource {
        policy: Option<PolicyConfig>,
        calls: AtomicUsize,
    }

    impl MockSource {
        fn serving(policy: PolicyConfig) -> Arc<Self> {
            Arc::new(Self {
                policy: Some(policy),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                policy: None,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PolicySource for MockSource {
        async fn fetch_policy(&self) -> Result<PolicyConfig> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.policy
                .clone()
                .ok_or_else(|| anyhow::anyhow!("server unavailable"))
        }
    }

    fn listener(source: Arc<MockSource>) -> PushListener<MockSource> {
        PushListener::new(
            "ws://127.0.0.1:1/unused",
            source,
            Arc::new(ConfigurationStore::new()),
            Arc::new(UserState::new("jdoe", true)),
            Backoff::new(Duration::from_millis(10), Duration::from_millis(40)),
        )
    }

    fn pushed() -> PolicyConfig {
        PolicyConfig::new(["A.exe"], ["bad.example.com"])
    }

    #[tokio::test]
    async fn test_update_for_our_user() {
        let listener = listener(MockSource::failing());
        let outcome = listener
            .handle_message(
                r#"{"type":"update","active_users":[{"name":"other","active":true},{"name":"jdoe","active":false}]}"#,
            )
            .await;
        assert_eq!(outcome, Dispatch::UserUpdated(false));
        assert!(!listener.user.is_active());
    }

    #[tokio::test]
    async fn test_update_without_our_user_is_noop() {
        let listener = listener(MockSource::failing());
        let outcome = listener
            .handle_message(r#"{"type":"update","active_users":[{"name":"other","active":false}]}"#)
            .await;
        assert_eq!(outcome, Dispatch::UserNotListed);
        assert!(listener.user.is_active());

        let outcome = listener
            .handle_message(r#"{"type":"update","active_users":null}"#)
            .await;
        assert_eq!(outcome, Dispatch::UserNotListed);
    }

    #[tokio::test]
    async fn test_refresh_and_configuracion_store_policy() {
        let source = MockSource::serving(pushed());
        let listener = listener(source.clone());

        assert_eq!(
            listener.handle_message(r#"{"type":"refresh"}"#).await,
            Dispatch::PolicyRefreshed
        );
        assert_eq!(listener.store.get(), pushed());

        listener.store.set(PolicyConfig::default());
        assert_eq!(
            listener
                .handle_message(r#"{"type":"configuracion","extra":1}"#)
                .await,
            Dispatch::PolicyRefreshed
        );
        assert_eq!(listener.store.get(), pushed());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_last_policy() {
        let listener = listener(MockSource::failing());
        listener.store.set(pushed());

        assert_eq!(
            listener.handle_message(r#"{"type":"refresh"}"#).await,
            Dispatch::RefreshFailed
        );
        assert_eq!(listener.store.get(), pushed());
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_frames() {
        let source = MockSource::serving(pushed());
        let listener = listener(source.clone());

        assert_eq!(
            listener.handle_message(r#"{"type":"ping"}"#).await,
            Dispatch::Ignored
        );
        assert_eq!(listener.handle_message("not json").await, Dispatch::Malformed);
        assert_eq!(
            listener.handle_message(r#"{"active_users":[]}"#).await,
            Dispatch::Malformed
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert!(listener.store.get().is_empty());
    }

    #[test]
    fn test_backoff_doubles_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_run_reconnects_and_applies_frames() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            // First connection is dropped straight after the handshake.
            let (stream, _) = server.accept().await.unwrap();
            drop(accept_async(stream).await.unwrap());

            let (stream, _) = server.accept().await.unwrap();
            let mut socket = accept_async(stream).await.unwrap();
            for frame in [
                r#"{"type":"update","active_users":[{"name":"jdoe","active":false}]}"#,
                r#"{"type":"refresh"}"#,
            ] {
                socket.send(Message::Text(frame.to_string())).await.unwrap();
            }
            // Hold the socket open until the client goes away.
            while socket.next().await.is_some() {}
        });

        let store = Arc::new(ConfigurationStore::new());
        let user = Arc::new(UserState::new("jdoe", true));
        let listener = PushListener::new(
            format!("ws://{addr}/api/v1/ws/jdoe/bac"),
            MockSource::serving(pushed()),
            store.clone(),
            user.clone(),
            Backoff::new(Duration::from_millis(10), Duration::from_millis(40)),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(shutdown_rx));

        wait_for(|| !user.is_active() && store.get() == pushed()).await;

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_while_endpoint_unreachable() {
        let listener = listener(MockSource::failing());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_silent_channel_is_abandoned() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            // Completes the handshake, then never reads or writes again.
            let (stream, _) = server.accept().await.unwrap();
            let silent = accept_async(stream).await.unwrap();

            let (stream, _) = server.accept().await.unwrap();
            let mut socket = accept_async(stream).await.unwrap();
            socket
                .send(Message::Text(
                    r#"{"type":"update","active_users":[{"name":"jdoe","active":false}]}"#
                        .to_string(),
                ))
                .await
                .unwrap();
            while socket.next().await.is_some() {}
            drop(silent);
        });

        let user = Arc::new(UserState::new("jdoe", true));
        let listener = PushListener::new(
            format!("ws://{addr}/api/v1/ws/jdoe/bac"),
            MockSource::failing(),
            Arc::new(ConfigurationStore::new()),
            user.clone(),
            Backoff::new(Duration::from_millis(10), Duration::from_millis(40)),
        )
        .with_keepalive(Duration::from_millis(50));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(shutdown_rx));

        wait_for(|| !user.is_active()).await;

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
