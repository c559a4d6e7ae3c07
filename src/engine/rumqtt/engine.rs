use super::event_map::{error_event, map_event};
use super::options::{
    build_mqtt_options, inflight_window, load_bundle, to_qos, Endpoint, EngineSettings, Identity,
    Security, MAX_PACKET_SIZE,
};
use crate::config::{
    CertReqs, ClientCert, Credentials, LastWill, ProtocolVersion, Psk, PublishTuning, ServerCert,
    TlsOptions,
};
use crate::engine::{ProtocolEngine, RawEvent};
use crate::protocol::codes::{EngineStatus, MessageId, Qos};
use crate::session::reconnect::{ReconnectPolicy, ReconnectionDecision};
use crate::session::registry::EventSink;
use bytes::Bytes;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Outgoing, SubscribeFilter};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the request channel between client and event loop
const REQUEST_CAPACITY: usize = 64;

/// How long `stop_loop` waits for the I/O task
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Mirrors the packet identifier sequence of `rumqttc`'s state machine so
/// commands can report the id the broker will see.
///
/// `rumqttc` numbers publishes (QoS > 0), subscribes and unsubscribes from one
/// counter that restarts at 1 when it reaches the in-flight window.
#[derive(Debug, Clone)]
pub struct PacketIdTracker {
    last: u16,
    max_inflight: u16,
}

impl PacketIdTracker {
    pub fn new(max_inflight: u16) -> Self {
        Self {
            last: 0,
            max_inflight,
        }
    }

    pub fn next_id(&mut self) -> MessageId {
        let next = self.last.wrapping_add(1);
        if next == self.max_inflight {
            self.last = 0;
            return next;
        }
        self.last = next;
        next
    }
}

struct IoTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<EventLoop>,
}

/// [`ProtocolEngine`] backed by `rumqttc` speaking MQTT 3.1.1
pub struct RumqttEngine {
    settings: EngineSettings,
    policy: ReconnectPolicy,
    sink: Option<EventSink>,
    endpoint: Option<Endpoint>,
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
    io_task: Option<IoTask>,
    packet_ids: PacketIdTracker,
    disconnect_requested: bool,
}

impl Default for RumqttEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RumqttEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RumqttEngine")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.client.is_some())
            .field("loop_running", &self.io_task.is_some())
            .finish()
    }
}

impl RumqttEngine {
    pub fn new() -> Self {
        Self {
            settings: EngineSettings::default(),
            policy: ReconnectPolicy::Disabled,
            sink: None,
            endpoint: None,
            client: None,
            event_loop: None,
            io_task: None,
            packet_ids: PacketIdTracker::new(u16::MAX),
            disconnect_requested: false,
        }
    }

    /// Build a fresh client/event loop pair for the remembered endpoint
    async fn open(&mut self) -> EngineStatus {
        let Some(endpoint) = self.endpoint.clone() else {
            return EngineStatus::Inval;
        };
        let options = match build_mqtt_options(&self.settings, &endpoint) {
            Ok(options) => options,
            Err(status) => return status,
        };

        self.halt_io().await;
        let inflight = options.inflight();
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        self.client = Some(client);
        self.event_loop = Some(event_loop);
        self.packet_ids = PacketIdTracker::new(inflight);
        self.disconnect_requested = false;

        info!(host = %endpoint.host, port = endpoint.port, "Connection prepared");
        EngineStatus::Success
    }

    /// Whether the request channel still has a live receiver
    fn loop_alive(&self) -> bool {
        self.io_task.is_some() || self.event_loop.is_some()
    }

    fn request_error(&self, error: &ClientError) -> EngineStatus {
        debug!("Request rejected by client: {}", error);
        if self.loop_alive() {
            EngineStatus::NoMem
        } else {
            EngineStatus::NoConn
        }
    }

    /// Stop the I/O task and keep its event loop for a later restart
    async fn halt_io(&mut self) {
        let Some(mut task) = self.io_task.take() else {
            return;
        };

        // let a queued DISCONNECT reach the wire before forcing a stop
        if self.disconnect_requested {
            if let Ok(joined) = tokio::time::timeout(STOP_TIMEOUT, &mut task.handle).await {
                self.recover(joined);
                return;
            }
        }

        let _ = task.shutdown.send(true);
        match tokio::time::timeout(STOP_TIMEOUT, &mut task.handle).await {
            Ok(joined) => self.recover(joined),
            Err(_) => {
                warn!("I/O task didn't shut down gracefully, forcing abort");
                task.handle.abort();
            }
        }
    }

    fn recover(&mut self, joined: Result<EventLoop, tokio::task::JoinError>) {
        match joined {
            Ok(event_loop) => self.event_loop = Some(event_loop),
            Err(e) if !e.is_cancelled() => warn!("I/O task ended with error: {}", e),
            Err(_) => {}
        }
    }
}

#[async_trait::async_trait]
impl ProtocolEngine for RumqttEngine {
    fn register_events(&mut self, sink: EventSink) {
        self.sink = Some(sink);
    }

    fn set_identity(
        &mut self,
        client_id: &str,
        clean_session: bool,
        version: ProtocolVersion,
    ) -> EngineStatus {
        if version == ProtocolVersion::V31 {
            return EngineStatus::NotSupported;
        }
        self.settings.identity = Some(Identity {
            client_id: client_id.to_string(),
            clean_session,
        });
        EngineStatus::Success
    }

    fn set_reconnect_policy(&mut self, policy: &ReconnectPolicy) -> EngineStatus {
        self.policy = policy.clone();
        EngineStatus::Success
    }

    fn set_will(&mut self, will: &LastWill) -> EngineStatus {
        if will.topic.is_empty() {
            return EngineStatus::Inval;
        }
        if will.topic.len() + will.payload.len() > MAX_PACKET_SIZE {
            return EngineStatus::PayloadSize;
        }
        self.settings.will = Some(will.clone());
        EngineStatus::Success
    }

    fn set_credentials(&mut self, credentials: &Credentials) -> EngineStatus {
        let password = credentials.password.clone().unwrap_or_default();
        self.settings.credentials = Some((credentials.username.clone(), password));
        EngineStatus::Success
    }

    fn set_publish_tuning(&mut self, tuning: &PublishTuning) -> EngineStatus {
        self.settings.inflight = Some(inflight_window(tuning.max_inflight_messages));
        if tuning.message_retry_secs > 0 {
            debug!(
                retry_secs = tuning.message_retry_secs,
                "Message retry interval is managed by the event loop; ignoring"
            );
        }
        EngineStatus::Success
    }

    fn set_tls_bundle(&mut self, server: &ServerCert, client: Option<&ClientCert>) -> EngineStatus {
        match load_bundle(server, client) {
            Ok(bundle) => {
                self.settings.security = Security::Bundle(bundle);
                EngineStatus::Success
            }
            Err(status) => status,
        }
    }

    fn set_tls_options(&mut self, options: &TlsOptions) -> EngineStatus {
        if options.insecure
            || options.cert_reqs == CertReqs::VerifyNone
            || options.tls_version.is_some()
            || options.ciphers.is_some()
        {
            return EngineStatus::NotSupported;
        }
        if matches!(self.settings.security, Security::Plain) {
            self.settings.security = Security::SystemRoots;
        }
        EngineStatus::Success
    }

    fn set_psk(&mut self, _psk: &Psk) -> EngineStatus {
        EngineStatus::NotSupported
    }

    async fn connect(&mut self, host: &str, port: u16, keep_alive_secs: u16) -> EngineStatus {
        self.endpoint = Some(Endpoint {
            host: host.to_string(),
            port,
            keep_alive_secs,
        });
        self.open().await
    }

    async fn reconnect(&mut self) -> EngineStatus {
        if self.endpoint.is_none() {
            return EngineStatus::Inval;
        }
        self.open().await
    }

    async fn disconnect(&mut self) -> EngineStatus {
        let Some(client) = &self.client else {
            return EngineStatus::NoConn;
        };
        match client.try_disconnect() {
            Ok(()) => {
                self.disconnect_requested = true;
                EngineStatus::Success
            }
            Err(e) => self.request_error(&e),
        }
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    ) -> (EngineStatus, MessageId) {
        let Some(client) = &self.client else {
            return (EngineStatus::NoConn, 0);
        };
        if topic.len() + payload.len() > MAX_PACKET_SIZE {
            return (EngineStatus::PayloadSize, 0);
        }

        if let Err(e) = client.try_publish(topic, to_qos(qos), retain, payload) {
            return (self.request_error(&e), 0);
        }
        let mid = match qos {
            Qos::AtMostOnce => 0,
            _ => self.packet_ids.next_id(),
        };
        (EngineStatus::Success, mid)
    }

    async fn subscribe(&mut self, filters: &[String], qos: Qos) -> (EngineStatus, MessageId) {
        let Some(client) = &self.client else {
            return (EngineStatus::NoConn, 0);
        };
        if filters.is_empty() {
            return (EngineStatus::Inval, 0);
        }

        let requests = filters
            .iter()
            .map(|filter| SubscribeFilter::new(filter.clone(), to_qos(qos)));
        if let Err(e) = client.try_subscribe_many(requests) {
            return (self.request_error(&e), 0);
        }
        (EngineStatus::Success, self.packet_ids.next_id())
    }

    async fn unsubscribe(&mut self, filter: &str) -> (EngineStatus, MessageId) {
        let Some(client) = &self.client else {
            return (EngineStatus::NoConn, 0);
        };
        if let Err(e) = client.try_unsubscribe(filter) {
            return (self.request_error(&e), 0);
        }
        (EngineStatus::Success, self.packet_ids.next_id())
    }

    async fn start_loop(&mut self) -> EngineStatus {
        if let Some(task) = &self.io_task {
            if !task.handle.is_finished() {
                return EngineStatus::Success;
            }
            self.halt_io().await;
        }
        let Some(event_loop) = self.event_loop.take() else {
            return EngineStatus::NoConn;
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_io(
            event_loop,
            self.sink,
            self.policy.clone(),
            shutdown_rx,
        ));
        self.io_task = Some(IoTask { shutdown, handle });
        EngineStatus::Success
    }

    async fn stop_loop(&mut self) -> EngineStatus {
        self.halt_io().await;
        EngineStatus::Success
    }

    async fn destroy(&mut self) {
        self.halt_io().await;
        self.client = None;
        self.event_loop = None;
        self.sink = None;
        debug!("Engine destroyed");
    }
}

impl Drop for RumqttEngine {
    fn drop(&mut self) {
        if let Some(task) = self.io_task.take() {
            let _ = task.shutdown.send(true);
            task.handle.abort();
        }
    }
}

fn emit(sink: Option<EventSink>, event: RawEvent) {
    if let Some(sink) = sink {
        sink.emit(event);
    }
}

/// Drive the event loop until shutdown, a requested disconnect, or a
/// connection loss the reconnect policy gives up on.
async fn run_io(
    mut event_loop: EventLoop,
    sink: Option<EventSink>,
    policy: ReconnectPolicy,
    mut shutdown_rx: watch::Receiver<bool>,
) -> EventLoop {
    let mut attempts = 0u32;

    loop {
        let polled = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Shutdown signal received, stopping I/O loop");
                    break;
                }
                continue;
            }
            polled = event_loop.poll() => polled,
        };

        match polled {
            Ok(event) => {
                let finished = matches!(event, Event::Outgoing(Outgoing::Disconnect));
                if let Some(raw) = map_event(&event) {
                    if raw == (RawEvent::Connect { rc: 0 }) {
                        attempts = 0;
                    }
                    emit(sink, raw);
                }
                if finished {
                    break;
                }
            }
            Err(error) => {
                warn!("Connection error: {}", error);
                emit(sink, error_event(&error));

                let shutdown_requested = *shutdown_rx.borrow();
                match policy.decide(attempts, shutdown_requested) {
                    ReconnectionDecision::Proceed { attempt, delay } => {
                        attempts = attempt;
                        info!(attempt, delay_secs = delay.as_secs(), "Reconnecting");
                        if !interruptible_sleep(&mut shutdown_rx, delay).await {
                            break;
                        }
                    }
                    ReconnectionDecision::AbortShutdownRequested => break,
                    ReconnectionDecision::AbortDisabled => {
                        debug!("Automatic reconnection disabled, stopping I/O loop");
                        break;
                    }
                }
            }
        }
    }
    event_loop
}

/// Returns `false` if shutdown was requested before `delay` elapsed
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => changed.is_ok() && !*shutdown_rx.borrow(),
        _ = tokio::time::sleep(delay) => true,
    }
}
