//! In-memory protocol engine for tests
//!
//! `MockEngine` behaves like a tiny loopback broker: connects are accepted,
//! publishes are acknowledged and routed back to matching subscriptions, and
//! every call is recorded. Events are delivered from a background task, the
//! same way a real engine's I/O loop delivers them.

use crate::config::{
    ClientCert, Credentials, LastWill, ProtocolVersion, Psk, PublishTuning, ServerCert, TlsOptions,
};
use crate::engine::{EventSink, ProtocolEngine, RawEvent, RawMessage};
use crate::protocol::codes::{EngineStatus, MessageId, Qos};
use crate::session::reconnect::ReconnectPolicy;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One recorded engine call
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    SetIdentity {
        client_id: String,
        clean_session: bool,
        version: ProtocolVersion,
    },
    SetReconnectPolicy(ReconnectPolicy),
    SetWill(LastWill),
    SetCredentials {
        username: String,
        password: Option<String>,
    },
    SetPublishTuning(PublishTuning),
    SetTlsBundle {
        server: ServerCert,
        client: Option<ClientCert>,
    },
    SetTlsOptions(TlsOptions),
    SetPsk {
        identity: String,
    },
    Connect {
        host: String,
        port: u16,
        keep_alive_secs: u16,
    },
    Reconnect,
    Disconnect,
    Publish {
        topic: String,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    },
    Subscribe {
        filters: Vec<String>,
        qos: Qos,
    },
    Unsubscribe {
        filter: String,
    },
    StartLoop,
    StopLoop,
    Destroy,
}

impl EngineCall {
    /// Method name of the call, as used by delays and failures
    pub fn name(&self) -> &'static str {
        match self {
            EngineCall::SetIdentity { .. } => "set_identity",
            EngineCall::SetReconnectPolicy(_) => "set_reconnect_policy",
            EngineCall::SetWill(_) => "set_will",
            EngineCall::SetCredentials { .. } => "set_credentials",
            EngineCall::SetPublishTuning(_) => "set_publish_tuning",
            EngineCall::SetTlsBundle { .. } => "set_tls_bundle",
            EngineCall::SetTlsOptions(_) => "set_tls_options",
            EngineCall::SetPsk { .. } => "set_psk",
            EngineCall::Connect { .. } => "connect",
            EngineCall::Reconnect => "reconnect",
            EngineCall::Disconnect => "disconnect",
            EngineCall::Publish { .. } => "publish",
            EngineCall::Subscribe { .. } => "subscribe",
            EngineCall::Unsubscribe { .. } => "unsubscribe",
            EngineCall::StartLoop => "start_loop",
            EngineCall::StopLoop => "stop_loop",
            EngineCall::Destroy => "destroy",
        }
    }
}

enum LoopMessage {
    Event(RawEvent),
    Stop,
}

/// Test-side view of a `MockEngine` that stays usable after the engine has
/// moved into a session
#[derive(Debug, Clone)]
pub struct MockProbe {
    calls: Arc<Mutex<Vec<EngineCall>>>,
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<LoopMessage>,
}

impl std::fmt::Debug for LoopMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopMessage::Event(event) => f.debug_tuple("Event").field(event).finish(),
            LoopMessage::Stop => f.write_str("Stop"),
        }
    }
}

impl MockProbe {
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.calls().iter().map(EngineCall::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|call| call.name() == name).count()
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Deliver an arbitrary event as if the broker had sent it
    pub fn inject(&self, event: RawEvent) {
        let _ = self.events.send(LoopMessage::Event(event));
    }

    /// Simulate the broker going away
    pub fn drop_connection(&self, rc: i32) {
        self.connected.store(false, Ordering::SeqCst);
        self.inject(RawEvent::Disconnect { rc });
    }
}

/// Loopback engine with a call log
#[derive(Debug)]
pub struct MockEngine {
    probe: MockProbe,
    sink: Option<EventSink>,
    pending: Option<mpsc::UnboundedReceiver<LoopMessage>>,
    loop_task: Option<JoinHandle<mpsc::UnboundedReceiver<LoopMessage>>>,
    delays: HashMap<&'static str, Duration>,
    failures: HashMap<&'static str, EngineStatus>,
    connect_rc: i32,
    endpoint: Option<(String, u16, u16)>,
    next_mid: MessageId,
    subscriptions: Vec<(String, Qos)>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        let (events, pending) = mpsc::unbounded_channel();
        Self {
            probe: MockProbe {
                calls: Arc::new(Mutex::new(Vec::new())),
                connected: Arc::new(AtomicBool::new(false)),
                events,
            },
            sink: None,
            pending: Some(pending),
            loop_task: None,
            delays: HashMap::new(),
            failures: HashMap::new(),
            connect_rc: 0,
            endpoint: None,
            next_mid: 0,
            subscriptions: Vec::new(),
        }
    }

    pub fn probe(&self) -> MockProbe {
        self.probe.clone()
    }

    /// Sleep for `delay` whenever `method` runs
    pub fn with_delay(mut self, method: &'static str, delay: Duration) -> Self {
        self.delays.insert(method, delay);
        self
    }

    /// Make `method` return `status` instead of succeeding
    pub fn fail_with(mut self, method: &'static str, status: EngineStatus) -> Self {
        self.failures.insert(method, status);
        self
    }

    /// Return code the broker answers connects with
    pub fn with_connect_rc(mut self, rc: i32) -> Self {
        self.connect_rc = rc;
        self
    }

    fn record(&self, call: EngineCall) -> Option<EngineStatus> {
        let name = call.name();
        if let Ok(mut calls) = self.probe.calls.lock() {
            calls.push(call);
        }
        self.failures.get(name).copied()
    }

    fn delay(&self, method: &'static str) -> Option<Duration> {
        self.delays.get(method).copied()
    }

    fn emit(&self, event: RawEvent) {
        let _ = self.probe.events.send(LoopMessage::Event(event));
    }

    fn next_message_id(&mut self) -> MessageId {
        self.next_mid = self.next_mid.wrapping_add(1);
        if self.next_mid == 0 {
            self.next_mid = 1;
        }
        self.next_mid
    }

    fn is_connected(&self) -> bool {
        self.probe.is_connected()
    }

    fn answer_connect(&self) -> EngineStatus {
        self.probe
            .connected
            .store(self.connect_rc == 0, Ordering::SeqCst);
        self.emit(RawEvent::Connect {
            rc: self.connect_rc,
        });
        EngineStatus::Success
    }

    async fn halt_loop(&mut self) {
        if let Some(task) = self.loop_task.take() {
            let _ = self.probe.events.send(LoopMessage::Stop);
            match task.await {
                Ok(pending) => self.pending = Some(pending),
                Err(e) => tracing::warn!("Mock event loop ended abnormally: {}", e),
            }
        }
    }

    fn setter(&self, call: EngineCall) -> EngineStatus {
        self.record(call).unwrap_or(EngineStatus::Success)
    }
}

async fn pause(delay: Option<Duration>) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

/// MQTT filter matching with `+` and `#`
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn min_qos(a: Qos, b: Qos) -> Qos {
    if a.as_i32() <= b.as_i32() {
        a
    } else {
        b
    }
}

#[async_trait]
impl ProtocolEngine for MockEngine {
    fn register_events(&mut self, sink: EventSink) {
        self.sink = Some(sink);
    }

    fn set_identity(
        &mut self,
        client_id: &str,
        clean_session: bool,
        version: ProtocolVersion,
    ) -> EngineStatus {
        self.setter(EngineCall::SetIdentity {
            client_id: client_id.to_string(),
            clean_session,
            version,
        })
    }

    fn set_reconnect_policy(&mut self, policy: &ReconnectPolicy) -> EngineStatus {
        self.setter(EngineCall::SetReconnectPolicy(policy.clone()))
    }

    fn set_will(&mut self, will: &LastWill) -> EngineStatus {
        self.setter(EngineCall::SetWill(will.clone()))
    }

    fn set_credentials(&mut self, credentials: &Credentials) -> EngineStatus {
        self.setter(EngineCall::SetCredentials {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        })
    }

    fn set_publish_tuning(&mut self, tuning: &PublishTuning) -> EngineStatus {
        self.setter(EngineCall::SetPublishTuning(*tuning))
    }

    fn set_tls_bundle(&mut self, server: &ServerCert, client: Option<&ClientCert>) -> EngineStatus {
        self.setter(EngineCall::SetTlsBundle {
            server: server.clone(),
            client: client.cloned(),
        })
    }

    fn set_tls_options(&mut self, options: &TlsOptions) -> EngineStatus {
        self.setter(EngineCall::SetTlsOptions(options.clone()))
    }

    fn set_psk(&mut self, psk: &Psk) -> EngineStatus {
        self.setter(EngineCall::SetPsk {
            identity: psk.identity.clone(),
        })
    }

    async fn connect(&mut self, host: &str, port: u16, keep_alive_secs: u16) -> EngineStatus {
        let failure = self.record(EngineCall::Connect {
            host: host.to_string(),
            port,
            keep_alive_secs,
        });
        pause(self.delay("connect")).await;
        if let Some(status) = failure {
            return status;
        }
        self.endpoint = Some((host.to_string(), port, keep_alive_secs));
        self.answer_connect()
    }

    async fn reconnect(&mut self) -> EngineStatus {
        let failure = self.record(EngineCall::Reconnect);
        pause(self.delay("reconnect")).await;
        if let Some(status) = failure {
            return status;
        }
        if self.endpoint.is_none() {
            return EngineStatus::Inval;
        }
        self.answer_connect()
    }

    async fn disconnect(&mut self) -> EngineStatus {
        let failure = self.record(EngineCall::Disconnect);
        pause(self.delay("disconnect")).await;
        if let Some(status) = failure {
            return status;
        }
        if !self.probe.connected.swap(false, Ordering::SeqCst) {
            return EngineStatus::NoConn;
        }
        self.emit(RawEvent::Disconnect { rc: 0 });
        EngineStatus::Success
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    ) -> (EngineStatus, MessageId) {
        let failure = self.record(EngineCall::Publish {
            topic: topic.to_string(),
            payload: payload.clone(),
            qos,
            retain,
        });
        pause(self.delay("publish")).await;
        if let Some(status) = failure {
            return (status, 0);
        }
        if !self.is_connected() {
            return (EngineStatus::NoConn, 0);
        }

        let mid = match qos {
            Qos::AtMostOnce => 0,
            _ => self.next_message_id(),
        };
        self.emit(RawEvent::Publish { mid: i32::from(mid) });

        let delivery = self
            .subscriptions
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, granted)| min_qos(qos, *granted))
            .max_by_key(|granted| granted.as_i32());
        if let Some(delivered_qos) = delivery {
            self.emit(RawEvent::Message(RawMessage {
                mid: i32::from(mid),
                topic: Some(topic.as_bytes().to_vec()),
                payload: Some(payload),
                qos: delivered_qos.as_i32(),
                retain: false,
            }));
        }
        (EngineStatus::Success, mid)
    }

    async fn subscribe(&mut self, filters: &[String], qos: Qos) -> (EngineStatus, MessageId) {
        let failure = self.record(EngineCall::Subscribe {
            filters: filters.to_vec(),
            qos,
        });
        pause(self.delay("subscribe")).await;
        if let Some(status) = failure {
            return (status, 0);
        }
        if !self.is_connected() {
            return (EngineStatus::NoConn, 0);
        }

        let mid = self.next_message_id();
        for filter in filters {
            self.subscriptions.retain(|(existing, _)| existing != filter);
            self.subscriptions.push((filter.clone(), qos));
        }
        self.emit(RawEvent::Subscribe {
            mid: i32::from(mid),
            qos_count: filters.len(),
            granted_qos: vec![qos.as_i32(); filters.len()],
        });
        (EngineStatus::Success, mid)
    }

    async fn unsubscribe(&mut self, filter: &str) -> (EngineStatus, MessageId) {
        let failure = self.record(EngineCall::Unsubscribe {
            filter: filter.to_string(),
        });
        pause(self.delay("unsubscribe")).await;
        if let Some(status) = failure {
            return (status, 0);
        }
        if !self.is_connected() {
            return (EngineStatus::NoConn, 0);
        }

        let mid = self.next_message_id();
        self.subscriptions.retain(|(existing, _)| existing != filter);
        self.emit(RawEvent::Unsubscribe { mid: i32::from(mid) });
        (EngineStatus::Success, mid)
    }

    async fn start_loop(&mut self) -> EngineStatus {
        if let Some(status) = self.record(EngineCall::StartLoop) {
            return status;
        }
        if self.loop_task.is_some() {
            return EngineStatus::Success;
        }
        let (Some(sink), Some(mut pending)) = (self.sink, self.pending.take()) else {
            return EngineStatus::Inval;
        };

        self.loop_task = Some(tokio::spawn(async move {
            while let Some(message) = pending.recv().await {
                match message {
                    LoopMessage::Event(event) => sink.emit(event),
                    LoopMessage::Stop => break,
                }
            }
            pending
        }));
        EngineStatus::Success
    }

    async fn stop_loop(&mut self) -> EngineStatus {
        if let Some(status) = self.record(EngineCall::StopLoop) {
            return status;
        }
        self.halt_loop().await;
        EngineStatus::Success
    }

    async fn destroy(&mut self) {
        self.record(EngineCall::Destroy);
        self.halt_loop().await;
        self.subscriptions.clear();
        self.probe.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        if let Some(task) = self.loop_task.take() {
            task.abort();
        }
    }
}
