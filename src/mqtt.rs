use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, LastWill, MqttOptions, Packet, QoS,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::transport::{
    Connection, Credentials, InboundMessage, Presence, PresenceMode, SessionError, Transport,
};

/// Kind of chat envelope on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    #[default]
    Chat,
    Error,
}

/// Chat message as published to an inbox topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEnvelope {
    pub from: String,
    pub body: String,
    #[serde(default)]
    pub kind: EnvelopeKind,
}

/// Retained presence payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresencePayload {
    pub show: String,
    pub status: String,
}

impl From<&Presence> for PresencePayload {
    fn from(presence: &Presence) -> Self {
        Self {
            show: presence.mode.as_str().to_string(),
            status: presence.status.clone(),
        }
    }
}

pub fn inbox_topic(prefix: &str, address: &str) -> String {
    format!("{}/{}/inbox", prefix, address)
}

pub fn presence_topic(prefix: &str, address: &str) -> String {
    format!("{}/{}/presence", prefix, address)
}

/// Addresses become topic levels, so wildcards and separators are not allowed
pub fn is_valid_address(address: &str) -> bool {
    !address.is_empty() && !address.contains(['/', '+', '#'])
}

/// Parse an incoming inbox payload as an InboundMessage
pub fn parse_envelope(payload: &[u8]) -> Result<InboundMessage, serde_json::Error> {
    let envelope: ChatEnvelope = serde_json::from_slice(payload)?;
    Ok(InboundMessage {
        from: envelope.from,
        body: envelope.body,
        is_error: envelope.kind == EnvelopeKind::Error,
    })
}

/// Queue an inbound message without blocking the event loop. A full queue
/// drops the message. Returns false once the receiver is gone.
fn forward(inbound: &mpsc::Sender<InboundMessage>, message: InboundMessage) -> bool {
    match inbound.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(dropped)) => {
            warn!(from = %dropped.from, "inbound queue full, dropping message");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

fn map_connection_error(err: ConnectionError) -> SessionError {
    match err {
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword),
        ) => SessionError::AuthFailure(format!("{:?}", code)),
        ConnectionError::ConnectionRefused(code) => {
            SessionError::NetworkFailure(format!("connection refused: {:?}", code))
        }
        other => SessionError::NetworkFailure(other.to_string()),
    }
}

/// Chat transport over an MQTT broker
pub struct MqttTransport {
    config: TransportConfig,
}

impl MqttTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    fn options(&self, credentials: &Credentials) -> Result<MqttOptions, SessionError> {
        let mut options = MqttOptions::new(
            format!("{}-{}", self.config.topic_prefix, credentials.identity),
            &credentials.host,
            credentials.port,
        );
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs));
        options.set_credentials(&credentials.identity, &credentials.secret);

        let offline = PresencePayload {
            show: PresenceMode::Offline.as_str().to_string(),
            status: String::new(),
        };
        let payload = serde_json::to_vec(&offline)
            .map_err(|e| SessionError::NetworkFailure(e.to_string()))?;
        options.set_last_will(LastWill::new(
            presence_topic(&self.config.topic_prefix, &credentials.identity),
            payload,
            QoS::AtLeastOnce,
            true,
        ));
        Ok(options)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(
        &self,
        credentials: &Credentials,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<Box<dyn Connection>, SessionError> {
        if !is_valid_address(&credentials.identity) {
            return Err(SessionError::AuthFailure(format!(
                "invalid login address: {}",
                credentials.identity
            )));
        }

        let (client, mut eventloop) = AsyncClient::new(self.options(credentials)?, 100);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(map_connection_error(e)),
                }
            }
        };
        let connect_timeout = self.config.connect_timeout_secs;
        match tokio::time::timeout(Duration::from_secs(connect_timeout), handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(SessionError::Timeout(connect_timeout)),
        }

        let inbox = inbox_topic(&self.config.topic_prefix, &credentials.identity);
        client
            .subscribe(inbox.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|e| SessionError::NetworkFailure(e.to_string()))?;

        info!(
            login = %credentials.identity,
            server = %credentials.host,
            port = credentials.port,
            "connected to chat broker"
        );

        let connected = Arc::new(AtomicBool::new(true));
        let flag = connected.clone();
        let task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.topic != inbox {
                            continue;
                        }
                        match parse_envelope(&publish.payload) {
                            Ok(message) => {
                                if !forward(&inbound, message) {
                                    debug!("inbound subscriber gone, stopping receive loop");
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(topic = %publish.topic, error = %e, "failed to parse chat envelope")
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("broker closed the session");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "chat connection lost");
                        break;
                    }
                }
            }
            flag.store(false, Ordering::SeqCst);
        });

        Ok(Box::new(MqttConnection {
            client,
            connected,
            identity: credentials.identity.clone(),
            prefix: self.config.topic_prefix.clone(),
            send_timeout: Duration::from_secs(self.config.send_timeout_secs),
            task: Mutex::new(Some(task)),
        }))
    }
}

pub struct MqttConnection {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    identity: String,
    prefix: String,
    send_timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttConnection {
    async fn publish(&self, topic: String, retain: bool, payload: Vec<u8>) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::TransportClosed);
        }
        let publish = self.client.publish(topic, QoS::AtLeastOnce, retain, payload);
        match tokio::time::timeout(self.send_timeout, publish).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::NetworkFailure(e.to_string())),
            Err(_) => Err(SessionError::Timeout(self.send_timeout.as_secs())),
        }
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().ok().and_then(|mut task| task.take())
    }
}

#[async_trait]
impl Connection for MqttConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_message(&self, to: &[String], body: &str) -> Result<(), SessionError> {
        let envelope = ChatEnvelope {
            from: self.identity.clone(),
            body: body.to_string(),
            kind: EnvelopeKind::Chat,
        };
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| SessionError::NetworkFailure(e.to_string()))?;

        let mut published = 0;
        for address in to {
            if !is_valid_address(address) {
                warn!(address = %address, "skipping invalid recipient address");
                continue;
            }
            self.publish(inbox_topic(&self.prefix, address), false, payload.clone())
                .await?;
            published += 1;
        }
        if published == 0 {
            return Err(SessionError::NetworkFailure(
                "no valid recipient address".to_string(),
            ));
        }
        Ok(())
    }

    async fn send_presence(&self, presence: &Presence) -> Result<(), SessionError> {
        let payload = serde_json::to_vec(&PresencePayload::from(presence))
            .map_err(|e| SessionError::NetworkFailure(e.to_string()))?;
        self.publish(presence_topic(&self.prefix, &self.identity), true, payload)
            .await
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = tokio::time::timeout(self.send_timeout, self.client.disconnect()).await;
        }
        if let Some(mut task) = self.take_task() {
            // Let the event loop flush the disconnect before tearing it down
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        info!(login = %self.identity, "chat connection closed");
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if let Some(task) = self.take_task() {
            task.abort();
        }
    }
}
