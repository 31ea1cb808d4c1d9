//! Impure I/O operations for the MQTT broker client
//!
//! This module owns the rumqttc client and its event loop task. Every
//! `connect` builds a fresh client and spawns a new event loop; the loop
//! stops at the first disconnect or refusal so that reconnection stays
//! under the device's control.

use super::connection::{
    build_tls_config, configure_mqtt_options, ConnectionParams, TransportError,
    DEFAULT_KEEP_ALIVE_SECS,
};
use super::message_handler::MessageHandler;
use crate::transport::{BrokerClient, BrokerEventSink, TlsSettings};
use async_trait::async_trait;
use rumqttc::tokio_rustls::rustls::ClientConfig;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument, Span};

/// Capacity of the request channel between client handle and event loop
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Grace period for the event loop task to observe a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Default)]
struct BrokerState {
    client: Option<AsyncClient>,
    event_loop_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    credentials: Option<(String, String)>,
    tls: Option<Arc<ClientConfig>>,
    sink: Option<Arc<dyn BrokerEventSink>>,
    disconnect_requested: bool,
}

/// Broker client backed by rumqttc (MQTT 3.1.1)
pub struct RumqttcBroker {
    client_id: String,
    keep_alive: Duration,
    span: Span,
    state: Mutex<BrokerState>,
}

impl RumqttcBroker {
    /// Create a client for `client_id`; `span` scopes all log output of the event loop
    pub fn new(client_id: impl Into<String>, span: Span) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            span,
            state: Mutex::new(BrokerState::default()),
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Create shutdown channel (pure function for channel setup)
    fn setup_shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    /// Poll the event loop until the session ends or shutdown is requested
    async fn run_event_loop(
        mut event_loop: EventLoop,
        sink: Option<Arc<dyn BrokerEventSink>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!(target: "mqtt_transport", "Shutdown signal received, stopping event loop");
                        break;
                    }
                }
                event_result = event_loop.poll() => {
                    let route = match &event_result {
                        Ok(event) => MessageHandler::route_mqtt_event(event),
                        Err(error) => MessageHandler::route_connection_error(error),
                    };

                    let keep_polling = match &sink {
                        Some(sink) => MessageHandler::dispatch(route, sink.as_ref()),
                        None => {
                            warn!("No event sink registered, dropping MQTT event");
                            event_result.is_ok()
                        }
                    };

                    if !keep_polling {
                        break;
                    }
                }
            }
        }
        debug!(target: "mqtt_transport", "MQTT event loop stopped");
    }

    /// Stop the running event loop task, if any, waiting briefly for it to finish
    ///
    /// After a disconnect request the loop is first given the chance to
    /// flush the DISCONNECT packet and exit on its own.
    async fn stop_event_loop(state: &mut BrokerState) {
        if let Some(handle) = state.event_loop_handle.as_mut() {
            if state.disconnect_requested
                && tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_ok()
            {
                state.event_loop_handle = None;
            }
        }
        state.disconnect_requested = false;

        if let Some(shutdown_tx) = state.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }

        if let Some(handle) = state.event_loop_handle.take() {
            let abort_handle = handle.abort_handle();
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Err(_) => {
                    warn!("Event loop task didn't shut down gracefully, forcing abort");
                    abort_handle.abort();
                }
                _ => {}
            }
        }

        state.client = None;
    }

    async fn current_client(&self) -> Result<AsyncClient, TransportError> {
        let state = self.state.lock().await;
        state
            .client
            .clone()
            .ok_or_else(|| TransportError::NotConnected("connect() has not been called".to_string()))
    }
}

#[async_trait]
impl BrokerClient for RumqttcBroker {
    async fn set_event_sink(&self, sink: Arc<dyn BrokerEventSink>) {
        self.state.lock().await.sink = Some(sink);
    }

    async fn authenticate(&self, username: &str, password: &str) {
        self.state.lock().await.credentials = Some((username.to_string(), password.to_string()));
    }

    async fn configure_tls(&self, settings: TlsSettings) -> Result<(), TransportError> {
        let config = build_tls_config(&settings)?;
        debug!(
            ca_certs = %settings.ca_certs.display(),
            tls_version = ?settings.tls_version,
            "Configured secure transport"
        );
        self.state.lock().await.tls = Some(Arc::new(config));
        Ok(())
    }

    async fn connect(&self, host: &str, port: u16) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;

        // A previous session's loop must not deliver events for the new one
        Self::stop_event_loop(&mut state).await;

        let params = ConnectionParams {
            client_id: self.client_id.clone(),
            host: host.to_string(),
            port,
            keep_alive: self.keep_alive,
            credentials: state.credentials.clone(),
            tls: state.tls.clone(),
        };
        debug!(?params, "Creating MQTT connection");

        let (client, event_loop) =
            AsyncClient::new(configure_mqtt_options(&params), REQUEST_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = Self::setup_shutdown_channel();
        let sink = state.sink.clone();

        let handle = tokio::spawn(
            Self::run_event_loop(event_loop, sink, shutdown_rx).instrument(self.span.clone()),
        );

        state.client = Some(client);
        state.shutdown_tx = Some(shutdown_tx);
        state.event_loop_handle = Some(handle);

        info!("Connecting... {}:{}", host, port);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let client = {
            let mut state = self.state.lock().await;
            let client = state.client.clone().ok_or_else(|| {
                TransportError::NotConnected("connect() has not been called".to_string())
            })?;
            state.disconnect_requested = true;
            client
        };
        client
            .disconnect()
            .await
            .map_err(TransportError::RequestFailed)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        let client = self.current_client().await?;
        client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(TransportError::RequestFailed)
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let client = self.current_client().await?;
        client
            .subscribe(topic, qos)
            .await
            .map_err(TransportError::RequestFailed)
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        Self::stop_event_loop(&mut state).await;
        info!("MQTT client stopped");
    }
}

impl Drop for RumqttcBroker {
    fn drop(&mut self) {
        let state = self.state.get_mut();

        // Signal shutdown to the event loop task if it's still running
        if let Some(shutdown_tx) = &state.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        // Note: We can't await in Drop; callers should call stop() for a graceful shutdown
        if let Some(handle) = state.event_loop_handle.take() {
            handle.abort();
        }
    }
}
