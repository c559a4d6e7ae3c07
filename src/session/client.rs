//! Session controller
//!
//! [`MqttClient`] owns one broker session. Every operation is queued on the
//! session's command queue and returns a [`Completion`] that resolves exactly
//! once with the engine's answer. Dropping a `Completion` is fine; the
//! command still runs.

use super::adapter::{Callbacks, SessionContext};
use super::queue::{BoxFuture, CommandQueue};
use super::registry::{self, EventSink, SessionKey};
use super::staging;
use super::state::{ConnectionState, SessionState};
use crate::config::MqttConfig;
use crate::engine::ProtocolEngine;
use crate::error::{SessionError, SessionResult};
use crate::protocol::codes::{ConnectReturnCode, DisconnectReason, EngineStatus, MessageId, Qos};
use crate::protocol::message::{CommandResult, MqttMessage};
use crate::protocol::topics::{validate_topic_filter, validate_topic_name};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn, Instrument};

/// Result of a queued operation, delivered exactly once
#[must_use = "a Completion does nothing unless awaited; drop it explicitly for fire-and-forget"]
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Completion<T> {
    fn ready(value: T) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(value);
        Self { rx }
    }
}

impl<T> Future for Completion<T> {
    type Output = SessionResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| SessionError::QueueClosed))
    }
}

/// Builder collecting callbacks before the session is created
pub struct MqttClientBuilder {
    config: MqttConfig,
    callbacks: Callbacks,
    connect_immediately: bool,
}

impl std::fmt::Debug for MqttClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClientBuilder")
            .field("config", &self.config)
            .field("callbacks", &self.callbacks)
            .field("connect_immediately", &self.connect_immediately)
            .finish()
    }
}

impl MqttClientBuilder {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            callbacks: Callbacks::default(),
            connect_immediately: false,
        }
    }

    pub fn on_connect<F>(mut self, callback: F) -> Self
    where
        F: Fn(ConnectReturnCode) + Send + Sync + 'static,
    {
        self.callbacks.on_connect = Some(Box::new(callback));
        self
    }

    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn(DisconnectReason) + Send + Sync + 'static,
    {
        self.callbacks.on_disconnect = Some(Box::new(callback));
        self
    }

    pub fn on_publish<F>(mut self, callback: F) -> Self
    where
        F: Fn(MessageId) + Send + Sync + 'static,
    {
        self.callbacks.on_publish = Some(Box::new(callback));
        self
    }

    pub fn on_message<F>(mut self, callback: F) -> Self
    where
        F: Fn(MqttMessage) + Send + Sync + 'static,
    {
        self.callbacks.on_message = Some(Box::new(callback));
        self
    }

    pub fn on_subscribe<F>(mut self, callback: F) -> Self
    where
        F: Fn(MessageId, Vec<i32>) + Send + Sync + 'static,
    {
        self.callbacks.on_subscribe = Some(Box::new(callback));
        self
    }

    pub fn on_unsubscribe<F>(mut self, callback: F) -> Self
    where
        F: Fn(MessageId) + Send + Sync + 'static,
    {
        self.callbacks.on_unsubscribe = Some(Box::new(callback));
        self
    }

    /// Queue a connect to the configured endpoint as soon as the session exists
    pub fn connect_immediately(mut self, connect: bool) -> Self {
        self.connect_immediately = connect;
        self
    }

    /// Stage the configuration into `engine` and start the session.
    ///
    /// Fails without touching the network if the configuration is invalid,
    /// the engine rejects an option, or there is no tokio runtime.
    pub fn build<E: ProtocolEngine>(self, mut engine: E) -> SessionResult<MqttClient<E>> {
        tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        let client_id = self.config.effective_client_id();
        let span = crate::session_span!(client_id = %client_id);
        let _guard = span.enter();

        staging::stage(&self.config, &client_id, &mut engine)?;

        registry::lib_init();
        let shared = Arc::new(SessionState::new());
        let context = Arc::new(
            SessionContext::new(client_id.clone(), shared.clone(), self.callbacks)
                .with_auto_reconnect(self.config.reconnect.is_enabled()),
        );
        let key = registry::global().register(context);
        engine.register_events(EventSink::new(key, registry::global()));

        let queue = match CommandQueue::spawn(engine, &client_id) {
            Ok(queue) => queue,
            Err(e) => {
                registry::global().unregister(key);
                return Err(e);
            }
        };

        info!(%key, host = %self.config.host, port = self.config.port, "Session created");
        let client = MqttClient {
            config: Arc::new(self.config),
            client_id,
            key,
            shared,
            queue,
            torn_down: false,
        };
        if self.connect_immediately {
            drop(client.connect_configured());
        }
        Ok(client)
    }
}

/// One MQTT broker session driven through a [`ProtocolEngine`]
pub struct MqttClient<E: ProtocolEngine> {
    config: Arc<MqttConfig>,
    client_id: String,
    key: SessionKey,
    shared: Arc<SessionState>,
    queue: CommandQueue<E>,
    torn_down: bool,
}

impl<E: ProtocolEngine> std::fmt::Debug for MqttClient<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("client_id", &self.client_id)
            .field("key", &self.key)
            .field("state", &self.shared.state())
            .field("running", &self.shared.is_running())
            .finish()
    }
}

impl MqttClient<crate::engine::RumqttEngine> {
    /// Start configuring a session. The engine is picked at
    /// [`MqttClientBuilder::build`], so this works for any engine type.
    pub fn builder(config: MqttConfig) -> MqttClientBuilder {
        MqttClientBuilder::new(config)
    }

    /// Session backed by the rumqttc engine
    pub fn with_rumqtt(config: MqttConfig) -> SessionResult<Self> {
        Self::builder(config).build(crate::engine::RumqttEngine::new())
    }
}

impl<E: ProtocolEngine> MqttClient<E> {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    pub fn session_key(&self) -> SessionKey {
        self.key
    }

    /// Broker confirmed the connection and it has not been lost since
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// A connect or reconnect was requested and not yet matched by a disconnect
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.subscribe()
    }

    /// Wait until the session reaches `target`
    pub async fn wait_for_state(&self, target: ConnectionState) -> SessionResult<()> {
        let mut rx = self.shared.subscribe();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::QueueClosed)
    }

    /// Queue `op` and hand back its completion
    fn request<T, F>(&self, op: &'static str, f: F) -> Completion<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut E) -> BoxFuture<'a, T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let span = crate::command_span!(op, client_id = %self.client_id);
        let queued = self.queue.enqueue(move |engine| {
            Box::pin(
                async move {
                    let output = f(engine).await;
                    if tx.send(output).is_err() {
                        debug!("Completion dropped before delivery");
                    }
                }
                .instrument(span),
            )
        });
        if let Err(e) = queued {
            warn!(op, "Failed to queue command: {}", e);
        }
        Completion { rx }
    }

    /// Connect to `host:port`; the engine loop is started after the connect
    pub fn connect(
        &self,
        host: impl Into<String>,
        port: u16,
        keep_alive_secs: u16,
    ) -> Completion<CommandResult> {
        let host = host.into();
        info!(client_id = %self.client_id, %host, port, "Connecting");
        self.shared.set_running(true);
        self.shared.set_state(ConnectionState::Connecting);

        let shared = self.shared.clone();
        self.request("connect", move |engine| {
            Box::pin(async move {
                let status = engine.connect(&host, port, keep_alive_secs).await;
                finish_connect(engine, &shared, status).await
            })
        })
    }

    /// Connect to the endpoint from the configuration
    pub fn connect_configured(&self) -> Completion<CommandResult> {
        self.connect(
            self.config.host.clone(),
            self.config.port,
            self.config.keep_alive_secs,
        )
    }

    /// Reconnect to the last endpoint
    pub fn reconnect(&self) -> Completion<CommandResult> {
        info!(client_id = %self.client_id, "Reconnecting");
        self.shared.set_running(true);
        self.shared.set_state(ConnectionState::Connecting);

        let shared = self.shared.clone();
        self.request("reconnect", move |engine| {
            Box::pin(async move {
                let status = engine.reconnect().await;
                finish_connect(engine, &shared, status).await
            })
        })
    }

    /// Disconnect and stop the engine loop.
    ///
    /// On a session that is not running this resolves with success at once
    /// and never reaches the engine.
    pub fn disconnect(&self) -> Completion<CommandResult> {
        self.request_disconnect(false)
    }

    /// `teardown` disconnects have nobody awaiting them, so failures are
    /// logged here
    fn request_disconnect(&self, teardown: bool) -> Completion<CommandResult> {
        if !self.shared.swap_running(false) {
            debug!(client_id = %self.client_id, "Disconnect on stopped session");
            return Completion::ready(CommandResult::new(EngineStatus::Success, 0));
        }
        info!(client_id = %self.client_id, "Disconnecting");
        self.shared.set_state(ConnectionState::Disconnecting);

        let shared = self.shared.clone();
        self.request("disconnect", move |engine| {
            Box::pin(async move {
                let status = engine.disconnect().await;
                if teardown && !status.is_success() {
                    warn!(%status, "Disconnect during teardown failed");
                }
                let stopped = engine.stop_loop().await;
                if !stopped.is_success() {
                    warn!(status = %stopped, "Engine loop did not stop cleanly");
                }
                // a connect queued after this disconnect owns the state now
                if !shared.is_running() {
                    shared.set_state(ConnectionState::Disconnected);
                }
                CommandResult::new(status, 0)
            })
        })
    }

    /// Publish `payload` on `topic`
    pub fn publish(
        &self,
        payload: impl Into<Bytes>,
        topic: impl Into<String>,
        qos: Qos,
        retain: bool,
    ) -> Completion<CommandResult> {
        let payload = payload.into();
        let topic = topic.into();
        self.request("publish", move |engine| {
            Box::pin(async move {
                if let Err(e) = validate_topic_name(&topic) {
                    debug!(%topic, "Refusing publish: {}", e);
                    return CommandResult::new(EngineStatus::Inval, 0);
                }
                let (status, mid) = engine.publish(&topic, payload, qos, retain).await;
                CommandResult::new(status, mid)
            })
        })
    }

    /// Publish a UTF-8 string
    pub fn publish_str(
        &self,
        text: &str,
        topic: impl Into<String>,
        qos: Qos,
        retain: bool,
    ) -> Completion<CommandResult> {
        self.publish(Bytes::copy_from_slice(text.as_bytes()), topic, qos, retain)
    }

    pub fn subscribe(&self, filter: impl Into<String>, qos: Qos) -> Completion<CommandResult> {
        self.subscribe_many([filter.into()], qos)
    }

    /// Subscribe to several filters in one request; the subscribe callback
    /// reports one granted QoS per filter, in this order
    pub fn subscribe_many<I, S>(&self, filters: I, qos: Qos) -> Completion<CommandResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let filters: Vec<String> = filters.into_iter().map(Into::into).collect();
        self.request("subscribe", move |engine| {
            Box::pin(async move {
                if filters.is_empty() {
                    return CommandResult::new(EngineStatus::Inval, 0);
                }
                if let Some(e) = filters.iter().find_map(|f| validate_topic_filter(f).err()) {
                    debug!("Refusing subscribe: {}", e);
                    return CommandResult::new(EngineStatus::Inval, 0);
                }
                let (status, mid) = engine.subscribe(&filters, qos).await;
                CommandResult::new(status, mid)
            })
        })
    }

    pub fn unsubscribe(&self, filter: impl Into<String>) -> Completion<CommandResult> {
        let filter = filter.into();
        self.request("unsubscribe", move |engine| {
            Box::pin(async move {
                if let Err(e) = validate_topic_filter(&filter) {
                    debug!(%filter, "Refusing unsubscribe: {}", e);
                    return CommandResult::new(EngineStatus::Inval, 0);
                }
                let (status, mid) = engine.unsubscribe(&filter).await;
                CommandResult::new(status, mid)
            })
        })
    }

    /// Resolve once every request issued before this call has finished
    pub async fn await_request_completion(&self) -> SessionResult<()> {
        self.queue.await_idle().await
    }

    /// Disconnect if needed, destroy the engine and wait for the worker
    pub async fn shutdown(mut self) {
        self.teardown();
        self.queue.close().await;
        info!(client_id = %self.client_id, "Session shut down");
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if self.shared.is_running() {
            drop(self.request_disconnect(true));
        }

        let key = self.key;
        let queued = self.queue.enqueue(move |engine| {
            Box::pin(async move {
                engine.destroy().await;
                registry::global().unregister(key);
            })
        });
        if let Err(e) = queued {
            warn!(client_id = %self.client_id, "Failed to queue engine teardown: {}", e);
            registry::global().unregister(key);
        }
    }
}

/// Start the engine loop after a successful connect or reconnect
async fn finish_connect<E: ProtocolEngine>(
    engine: &mut E,
    shared: &SessionState,
    status: EngineStatus,
) -> CommandResult {
    if !status.is_success() {
        warn!(%status, "Engine refused to connect");
        if shared.state() == ConnectionState::Connecting {
            shared.set_state(ConnectionState::Disconnected);
        }
        return CommandResult::new(status, 0);
    }
    CommandResult::new(engine.start_loop().await, 0)
}

impl<E: ProtocolEngine> Drop for MqttClient<E> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockEngine;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn config() -> MqttConfig {
        MqttConfig::new("client-unit", "localhost", 1883, 60)
    }

    #[tokio::test]
    async fn test_build_does_not_connect() {
        let engine = MockEngine::new();
        let probe = engine.probe();
        let client = MqttClient::builder(config()).build(engine).unwrap();

        client.await_request_completion().await.unwrap();
        assert_eq!(probe.count("connect"), 0);
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_connect_immediately() {
        let engine = MockEngine::new();
        let probe = engine.probe();
        let client = MqttClient::builder(config())
            .connect_immediately(true)
            .build(engine)
            .unwrap();

        client.await_request_completion().await.unwrap();
        assert_eq!(probe.count("connect"), 1);
        assert!(client.is_running());
    }

    #[test]
    fn test_build_without_runtime() {
        let result = MqttClient::builder(config()).build(MockEngine::new());
        assert!(matches!(result, Err(SessionError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_synchronously() {
        let mut bad = config();
        bad.port = 0;
        let result = MqttClient::builder(bad).build(MockEngine::new());
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_sets_connecting_then_connected() {
        let client = MqttClient::builder(config()).build(MockEngine::new()).unwrap();
        let completion = client.connect("localhost", 1883, 60);
        assert_eq!(client.connection_state(), ConnectionState::Connecting);

        let result = completion.await.unwrap();
        assert!(result.is_success());
        tokio::time::timeout(
            Duration::from_secs(1),
            client.wait_for_state(ConnectionState::Connected),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let engine = MockEngine::new().fail_with("connect", EngineStatus::Eai);
        let client = MqttClient::builder(config()).build(engine).unwrap();

        let result = client.connect("nowhere.invalid", 1883, 60).await.unwrap();
        assert_eq!(result.status, EngineStatus::Eai);
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_publish_with_wildcard_topic_is_refused_locally() {
        let engine = MockEngine::new();
        let probe = engine.probe();
        let client = MqttClient::builder(config()).build(engine).unwrap();

        let result = client
            .publish_str("x", "a/#", Qos::AtMostOnce, false)
            .await
            .unwrap();
        assert_eq!(result.status, EngineStatus::Inval);
        assert_eq!(probe.count("publish"), 0);
    }

    #[tokio::test]
    async fn test_subscribe_many_empty_is_invalid() {
        let client = MqttClient::builder(config()).build(MockEngine::new()).unwrap();
        let result = client
            .subscribe_many(Vec::<String>::new(), Qos::AtMostOnce)
            .await
            .unwrap();
        assert_eq!(result.status, EngineStatus::Inval);
    }

    #[tokio::test]
    async fn test_dropped_completion_still_runs() {
        let engine = MockEngine::new();
        let probe = engine.probe();
        let client = MqttClient::builder(config()).build(engine).unwrap();

        drop(client.connect("localhost", 1883, 60));
        client.await_request_completion().await.unwrap();
        assert_eq!(probe.count("connect"), 1);
    }

    #[tokio::test]
    async fn test_drop_disconnects_then_destroys() {
        let engine = MockEngine::new();
        let probe = engine.probe();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = MqttClient::builder(config())
            .on_disconnect(move |reason| {
                let _ = tx.send(reason);
            })
            .build(engine)
            .unwrap();
        let key = client.session_key();

        client.connect("localhost", 1883, 60).await.unwrap();
        drop(client);

        let reason = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, DisconnectReason::Requested);

        tokio::time::timeout(Duration::from_secs(1), async {
            while probe.count("destroy") == 0 || registry::global().contains(key) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let names = probe.names();
        let disconnect = names.iter().position(|n| *n == "disconnect").unwrap();
        let destroy = names.iter().position(|n| *n == "destroy").unwrap();
        assert!(disconnect < destroy);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_teardown_disconnect_is_logged() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();
        // current-thread runtime: the queue worker logs on this thread
        let _guard = tracing::subscriber::set_default(subscriber);

        let engine = MockEngine::new().fail_with("disconnect", EngineStatus::Errno);
        let probe = engine.probe();
        let client = MqttClient::builder(config()).build(engine).unwrap();
        client.connect("localhost", 1883, 60).await.unwrap();
        drop(client);

        tokio::time::timeout(Duration::from_secs(1), async {
            while probe.count("destroy") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Disconnect during teardown failed"), "{output}");
    }

    #[tokio::test]
    async fn test_shutdown_of_idle_session_only_destroys() {
        let engine = MockEngine::new();
        let probe = engine.probe();
        let client = MqttClient::builder(config()).build(engine).unwrap();
        probe.clear();

        client.shutdown().await;
        assert_eq!(probe.names(), vec!["destroy"]);
    }
}
