// Best-effort emotion event publishing over MQTT

use crate::config::MqttConfig;
use crate::error::{FerError, Result};
use crate::models::{Emotion, EmotionEvent, PixelRegion};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, NetworkOptions, Outgoing, Packet, QoS, Transport,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

/// Receives emotion events from the perception loop. Implementations must
/// not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EmotionEvent);
}

/// Lifecycle of the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Counters describing what happened to emitted events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Handed to the broker client
    pub published: u64,
    /// Discarded because no connection was up
    pub dropped: u64,
    /// Rejected by serialization or the broker client
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerTransport {
    Tcp,
    Tls,
    Ws,
    Wss,
}

/// A parsed broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub transport: BrokerTransport,
    pub host: String,
    pub port: u16,
    url: String,
}

impl BrokerEndpoint {
    /// Parses `mqtt://`, `tcp://`, `mqtts://`, `ssl://`, `ws://` and `wss://`
    /// URLs, filling in the scheme's default port.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|e| FerError::Config(format!("Invalid broker URL {raw:?}: {e}")))?;

        let (transport, default_port) = match url.scheme() {
            "mqtt" | "tcp" => (BrokerTransport::Tcp, 1883),
            "mqtts" | "ssl" | "tls" => (BrokerTransport::Tls, 8883),
            "ws" => (BrokerTransport::Ws, 80),
            "wss" => (BrokerTransport::Wss, 443),
            other => {
                return Err(FerError::Config(format!(
                    "Unsupported broker URL scheme {other:?}"
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| FerError::Config(format!("Broker URL {raw:?} has no host")))?
            .to_string();

        Ok(Self {
            transport,
            host,
            port: url.port().unwrap_or(default_port),
            url: url.to_string(),
        })
    }

    fn mqtt_options(&self, client_id: &str) -> MqttOptions {
        // Websocket transports take the full URL as the broker address
        let broker = match self.transport {
            BrokerTransport::Ws | BrokerTransport::Wss => self.url.clone(),
            BrokerTransport::Tcp | BrokerTransport::Tls => self.host.clone(),
        };
        let mut options = MqttOptions::new(client_id, broker, self.port);
        match self.transport {
            BrokerTransport::Tcp => {}
            BrokerTransport::Tls => {
                options.set_transport(Transport::tls_with_default_config());
            }
            BrokerTransport::Ws => {
                options.set_transport(Transport::Ws);
            }
            BrokerTransport::Wss => {
                options.set_transport(Transport::wss_with_default_config());
            }
        }
        options
    }
}

impl std::fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

struct Session {
    client: AsyncClient,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct PublisherInner {
    config: MqttConfig,
    endpoint: BrokerEndpoint,
    client_id: String,
    qos: QoS,
    state: Arc<watch::Sender<ConnectionState>>,
    session: Mutex<Option<Session>>,
    shut_down: AtomicBool,
    published: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Publishes emotion events to an MQTT broker.
///
/// Delivery is best effort and at most once per event: nothing is queued
/// while the connection is down. One connection is opened lazily on first
/// use and reconnected at a fixed interval until [`EventPublisher::shutdown`].
pub struct EventPublisher {
    inner: Option<Arc<PublisherInner>>,
}

impl EventPublisher {
    /// Creates a publisher for `config`, identifying itself as `client_id`.
    /// Does not connect.
    pub fn new(config: MqttConfig, client_id: impl Into<String>) -> Result<Self> {
        config.validate()?;
        let endpoint = BrokerEndpoint::parse(&config.url)?;
        let qos = match config.qos {
            0 => QoS::AtMostOnce,
            _ => QoS::AtLeastOnce,
        };
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            inner: Some(Arc::new(PublisherInner {
                config,
                endpoint,
                client_id: client_id.into(),
                qos,
                state: Arc::new(state),
                session: Mutex::new(None),
                shut_down: AtomicBool::new(false),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            })),
        })
    }

    /// A publisher that ignores every event
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Publisher for an optional broker section; `None` disables publishing
    pub fn from_config(config: Option<&MqttConfig>, client_id: &str) -> Result<Self> {
        match config {
            Some(config) => Self::new(config.clone(), client_id),
            None => {
                info!("No MQTT configuration, event publishing disabled");
                Ok(Self::disabled())
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner
            .as_ref()
            .map_or(ConnectionState::Disconnected, |inner| *inner.state.borrow())
    }

    /// Watch channel following connection state changes
    pub fn state_changes(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.inner.as_ref().map(|inner| inner.state.subscribe())
    }

    pub fn stats(&self) -> DeliveryStats {
        self.inner
            .as_ref()
            .map_or_else(DeliveryStats::default, |inner| DeliveryStats {
                published: inner.published.load(Ordering::Relaxed),
                dropped: inner.dropped.load(Ordering::Relaxed),
                failed: inner.failed.load(Ordering::Relaxed),
            })
    }

    /// Starts the connection if it is not running yet. Must be called from
    /// within a tokio runtime.
    pub fn connect(&self) {
        if let Some(inner) = &self.inner {
            inner.ensure_session();
        }
    }

    /// Builds an event stamped with the current time and publishes it
    pub fn publish(
        &self,
        device_id: Option<&str>,
        emotion: Emotion,
        confidence: f32,
        region: Option<PixelRegion>,
    ) {
        self.publish_event(EmotionEvent::new(
            device_id.map(str::to_string),
            emotion,
            confidence,
            region,
        ));
    }

    /// Hands `event` to the broker client if connected, otherwise drops it.
    /// Never blocks and never fails.
    pub fn publish_event(&self, event: EmotionEvent) {
        let Some(inner) = &self.inner else {
            return;
        };

        let client = inner.ensure_session();
        let connected = *inner.state.borrow() == ConnectionState::Connected;
        let Some(client) = client.filter(|_| connected) else {
            debug!("MQTT not connected; skipping {} event", event.emotion);
            inner.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize emotion event: {}", e);
                inner.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match client.try_publish(inner.config.topic.as_str(), inner.qos, false, payload) {
            Ok(()) => {
                inner.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("MQTT publish error: {}", e);
                inner.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Closes the connection. Later events are dropped and no reconnection
    /// is attempted.
    pub async fn shutdown(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.shut_down.store(true, Ordering::SeqCst);

        let session = inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            let _ = session.shutdown.send(());
            if let Err(e) = session.task.await {
                error!("MQTT connection task failed: {}", e);
            }
        }
        inner.state.send_replace(ConnectionState::Disconnected);
    }
}

impl EventSink for EventPublisher {
    fn emit(&self, event: EmotionEvent) {
        self.publish_event(event);
    }
}

impl PublisherInner {
    /// Returns the shared client, spawning the connection task on first use
    fn ensure_session(&self) -> Option<AsyncClient> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = session.as_ref() {
            return Some(existing.client.clone());
        }
        if self.shut_down.load(Ordering::SeqCst) {
            return None;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Cannot start MQTT connection outside an async runtime: {}", e);
                return None;
            }
        };

        let mut options = self.endpoint.mqtt_options(&self.client_id);
        options
            .set_keep_alive(self.config.keep_alive())
            .set_clean_session(true);
        if let Some(username) = &self.config.username {
            options.set_credentials(
                username.clone(),
                self.config.password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(options, 16);
        let mut network = NetworkOptions::new();
        network.set_connection_timeout(self.config.connect_timeout_secs);
        eventloop.set_network_options(network);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        info!("Connecting to MQTT broker {} as {}", self.endpoint, self.client_id);
        self.state.send_replace(ConnectionState::Connecting);
        let task = runtime.spawn(drive_connection(
            eventloop,
            client.clone(),
            Arc::clone(&self.state),
            shutdown_rx,
            self.config.reconnect_interval(),
        ));

        *session = Some(Session {
            client: client.clone(),
            shutdown: shutdown_tx,
            task,
        });
        Some(client)
    }
}

/// Polls the event loop, tracking connection state and retrying at a fixed
/// interval, until the shutdown channel fires or its sender is dropped.
async fn drive_connection(
    mut eventloop: EventLoop,
    client: AsyncClient,
    state: Arc<watch::Sender<ConnectionState>>,
    mut shutdown: oneshot::Receiver<()>,
    reconnect_interval: Duration,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT connected");
                    state.send_replace(ConnectionState::Connected);
                }
                Ok(_) => {}
                Err(e) => {
                    let previous = state.send_replace(ConnectionState::Connecting);
                    if previous == ConnectionState::Connected {
                        warn!("MQTT connection lost: {}", e);
                    } else {
                        warn!("MQTT connection attempt failed: {}", e);
                    }
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(reconnect_interval) => {
                            info!("MQTT reconnecting...");
                        }
                    }
                }
            },
        }
    }

    if *state.borrow() == ConnectionState::Connected && client.try_disconnect().is_ok() {
        let flushed = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            debug!("Timed out sending MQTT disconnect");
        }
    }
    state.send_replace(ConnectionState::Disconnected);
    info!("MQTT connection closed");
}
