//! Session driver
//!
//! One run of one device: authenticate, connect (with backoff), subscribe to
//! the control topics, publish the numbered messages, report state, then
//! tear down. Teardown runs on every exit path, including early failures.

use super::connection::{AttemptOutcome, ConnectionState, ConnectionStateMachine};
use super::events::{DeviceEventSink, SessionStats};
use super::inbound::InboundHandler;
use crate::auth::{TokenIssuer, UNUSED_USERNAME};
use crate::config::DeviceConfig;
use crate::device_span;
use crate::error::{DeviceError, DeviceResult};
use crate::protocol::identity::DeviceIdentity;
use crate::protocol::messages::{telemetry_payloads, MessageKind};
use crate::protocol::topics::TopicSet;
use crate::transport::mqtt::RumqttcBroker;
use crate::transport::{BrokerClient, TlsSettings};
use rand::Rng;
use rumqttc::QoS;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument, Span};

/// Per-run settings shared by every device of a fleet
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub host: String,
    pub port: u16,
    /// `None` connects without TLS
    pub tls: Option<TlsSettings>,
    pub num_messages: u32,
    pub message_kind: MessageKind,
    pub publish_delay_min: Duration,
    pub publish_delay_max: Duration,
    pub connect_timeout: Duration,
    pub publish_final_state: bool,
    pub state_payload: String,
}

impl SessionSettings {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            host: config.mqtt.hostname.clone(),
            port: config.mqtt.port,
            tls: config.tls_settings(),
            num_messages: config.session.num_messages,
            message_kind: config.session.message_type,
            publish_delay_min: Duration::from_secs(config.session.publish_delay_min_secs),
            publish_delay_max: Duration::from_secs(config.session.publish_delay_max_secs),
            connect_timeout: config.connect_timeout(),
            publish_final_state: config.session.publish_final_state,
            state_payload: config.session.state_payload.clone(),
        }
    }

    fn publish_delay(&self) -> Duration {
        if self.publish_delay_max <= self.publish_delay_min {
            return self.publish_delay_min;
        }
        let millis = rand::thread_rng().gen_range(
            self.publish_delay_min.as_millis() as u64..=self.publish_delay_max.as_millis() as u64,
        );
        Duration::from_millis(millis)
    }
}

/// Summary of a completed run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub device_id: String,
    pub published: u32,
    pub acked: u64,
    pub configs: u64,
    pub commands: u64,
    pub empty_payloads: u64,
    pub malformed: u64,
    pub rejected_subscriptions: u64,
    pub reconnects: u32,
    pub last_config: Option<Value>,
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: published {} (acked {}), configs {}, commands {}, malformed {}, rejected subscriptions {}, reconnects {}",
            self.device_id,
            self.published,
            self.acked,
            self.configs,
            self.commands,
            self.malformed,
            self.rejected_subscriptions,
            self.reconnects
        )
    }
}

/// Drives one device through a full session
pub struct SessionDriver {
    identity: DeviceIdentity,
    topics: TopicSet,
    issuer: TokenIssuer,
    broker: Arc<dyn BrokerClient>,
    settings: SessionSettings,
    state_machine: Arc<ConnectionStateMachine>,
    stats: Arc<SessionStats>,
    span: Span,
}

impl SessionDriver {
    pub fn new(
        identity: DeviceIdentity,
        issuer: TokenIssuer,
        broker: Arc<dyn BrokerClient>,
        settings: SessionSettings,
        span: Span,
    ) -> Self {
        let topics = TopicSet::for_identity(&identity);
        let state_machine = Arc::new(ConnectionStateMachine::new(
            identity.device_id(),
            span.clone(),
        ));
        Self {
            identity,
            topics,
            issuer,
            broker,
            settings,
            state_machine,
            stats: Arc::new(SessionStats::new()),
            span,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state_machine(&self) -> &Arc<ConnectionStateMachine> {
        &self.state_machine
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    /// Run the session to completion
    pub async fn run(&self) -> DeviceResult<SessionReport> {
        let span = self.span.clone();
        async {
            let sink = DeviceEventSink::new(
                self.state_machine.clone(),
                InboundHandler::new(self.topics.clone()),
                self.stats.clone(),
                self.span.clone(),
            );
            self.broker.set_event_sink(Arc::new(sink)).await;

            let outcome = self.drive().await;
            self.teardown().await;

            match outcome {
                Ok(progress) => {
                    let report = self.report(progress);
                    info!("Finished: {}", report);
                    Ok(report)
                }
                Err(e) => {
                    error!(error = %e, "Session failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(&self) -> DeviceResult<Progress> {
        let mut progress = Progress::default();

        // Fatal credential problems surface before any network activity
        let token = self.issuer.issue(&self.identity)?;
        self.broker.authenticate(UNUSED_USERNAME, token.as_str()).await;
        match &self.settings.tls {
            Some(tls) => self.broker.configure_tls(tls.clone()).await?,
            None => warn!("No CA certificates configured, connecting without TLS"),
        }

        self.connect_until_confirmed(false).await?;
        self.subscribe_control_topics().await?;

        let topic = match self.settings.message_kind {
            MessageKind::Event => &self.topics.events,
            MessageKind::State => &self.topics.state,
        };

        for (index, payload) in telemetry_payloads(&self.identity, self.settings.num_messages).enumerate() {
            info!(
                "Publishing message {}/{}: '{}'",
                index + 1,
                self.settings.num_messages,
                payload
            );
            self.publish_in_session(topic, payload.as_bytes(), &mut progress)
                .await?;
            progress.published += 1;

            tokio::time::sleep(self.settings.publish_delay()).await;
        }

        if self.settings.publish_final_state {
            self.ensure_connected(&mut progress).await?;
            info!(topic = %self.topics.state, "Publishing final state");
            self.broker
                .publish(
                    &self.topics.state,
                    self.settings.state_payload.as_bytes().to_vec(),
                    QoS::AtMostOnce,
                    false,
                )
                .await?;
        }

        Ok(progress)
    }

    /// Connect, retrying through the backoff path until confirmed
    ///
    /// Every attempt after the first signs a fresh token. A silent broker
    /// ends the run with `ConnectTimeout`; exhausting the backoff ends it
    /// with `BackoffExhausted`.
    async fn connect_until_confirmed(&self, fresh_token: bool) -> DeviceResult<()> {
        let mut needs_token = fresh_token;
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            if needs_token {
                let token = self.issuer.issue(&self.identity)?;
                self.broker.authenticate(UNUSED_USERNAME, token.as_str()).await;
            }
            needs_token = true;

            debug!(attempt, host = %self.settings.host, port = self.settings.port, "Connecting");
            match self
                .state_machine
                .connect(self.broker.as_ref(), &self.settings.host, self.settings.port)
                .await
            {
                Ok(()) => {}
                Err(DeviceError::Transport(e)) => {
                    warn!(attempt, error = %e, "Connect attempt failed");
                    continue;
                }
                Err(e) => return Err(e),
            }

            match self
                .state_machine
                .wait_for_connected(self.settings.connect_timeout)
                .await?
            {
                AttemptOutcome::Connected => {
                    info!(attempt, "Connected");
                    return Ok(());
                }
                AttemptOutcome::Failed => warn!(attempt, "Connection attempt refused"),
            }
        }
    }

    async fn subscribe_control_topics(&self) -> DeviceResult<()> {
        for topic in [&self.topics.config, &self.topics.commands] {
            info!(%topic, "Subscribing");
            self.broker.subscribe(topic, QoS::AtLeastOnce).await?;
        }
        Ok(())
    }

    /// Reconnect and re-subscribe if the broker dropped the session
    async fn ensure_connected(&self, progress: &mut Progress) -> DeviceResult<()> {
        if self.state_machine.state() == ConnectionState::Connected {
            return Ok(());
        }

        warn!("Connection lost, reconnecting");
        progress.reconnects += 1;
        self.connect_until_confirmed(true).await?;
        self.subscribe_control_topics().await
    }

    async fn publish_in_session(
        &self,
        topic: &str,
        payload: &[u8],
        progress: &mut Progress,
    ) -> DeviceResult<()> {
        loop {
            self.ensure_connected(progress).await?;
            match self
                .broker
                .publish(topic, payload.to_vec(), QoS::AtLeastOnce, false)
                .await
            {
                Ok(()) => return Ok(()),
                // The session dropped between the check and the publish
                Err(e) if self.state_machine.state() != ConnectionState::Connected => {
                    warn!(error = %e, "Publish failed, retrying after reconnect");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Disconnect and release the adapter's background task
    async fn teardown(&self) {
        if let Err(e) = self.state_machine.disconnect(self.broker.as_ref()).await {
            debug!(error = %e, "Disconnect during teardown failed");
        }
        self.broker.stop().await;
    }

    fn report(&self, progress: Progress) -> SessionReport {
        SessionReport {
            device_id: self.identity.device_id().to_string(),
            published: progress.published,
            acked: self.stats.acked(),
            configs: self.stats.configs(),
            commands: self.stats.commands(),
            empty_payloads: self.stats.empty_payloads(),
            malformed: self.stats.malformed(),
            rejected_subscriptions: self.stats.rejected_subscriptions(),
            reconnects: progress.reconnects,
            last_config: self.stats.last_config(),
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    published: u32,
    reconnects: u32,
}

/// Outcome of one device in a fleet run
pub type FleetResult = (String, DeviceResult<SessionReport>);

/// Run one session per configured device, concurrently, over rumqttc
pub async fn run_fleet(config: &DeviceConfig) -> Vec<FleetResult> {
    let keep_alive = config.keep_alive();
    run_fleet_with(config, move |identity, span| {
        Arc::new(RumqttcBroker::new(identity.client_id(), span).with_keep_alive(keep_alive))
    })
    .await
}

/// Run one session per configured device with brokers from `make_broker`
///
/// Results come back in the configured device order.
pub async fn run_fleet_with<F>(config: &DeviceConfig, make_broker: F) -> Vec<FleetResult>
where
    F: Fn(&DeviceIdentity, Span) -> Arc<dyn BrokerClient>,
{
    let settings = SessionSettings::from_config(config);
    let mut sessions = JoinSet::new();

    for (index, identity) in config.identities().into_iter().enumerate() {
        let span = device_span!(identity.device_id());
        let broker = make_broker(&identity, span.clone());
        let driver = SessionDriver::new(
            identity,
            config.token_issuer(),
            broker,
            settings.clone(),
            span,
        );
        sessions.spawn(async move {
            let device_id = driver.identity().device_id().to_string();
            (index, device_id, driver.run().await)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = sessions.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => error!("Device session task failed: {}", e),
        }
    }

    results.sort_by_key(|(index, _, _)| *index);
    results
        .into_iter()
        .map(|(_, device_id, result)| (device_id, result))
        .collect()
}
