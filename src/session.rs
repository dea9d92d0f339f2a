//! Session manager.
//!
//! Owns the single live chat connection. Every operation that touches the
//! connection (connect, send, presence, disconnect, liveness) goes through one
//! async mutex, so heartbeat ticks and replies to inbound messages never race
//! on the wire.
//!
//! Reconnection is lazy: a dropped link is only re-established by the next
//! call that needs it (a send, a presence publish from the heartbeat, or an
//! explicit `connect`). There is no backoff and no background watcher.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::{split_addresses, Config};
use crate::shell::Shell;
use crate::transport::{
    Connection, Credentials, InboundMessage, Presence, PresenceMode, SessionError, Transport,
    INBOUND_QUEUE_CAPACITY,
};

/// Outcome of a send or presence publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// No live connection and reconnecting failed. Silent by design.
    NotConnected,
    /// The transport rejected the send. Not retried.
    Failed,
}

/// Something that can re-publish presence on demand
#[async_trait]
pub trait PresenceSink: Send + Sync {
    async fn publish_presence(&self, mode: PresenceMode) -> Delivery;
}

/// `[TAG] YYYY-mm-dd HH:MM:SS` header followed by the message
pub fn format_report(tag: &str, at: DateTime<Local>, msg: &str) -> String {
    format!("[{}] {}\n{}", tag, at.format("%Y-%m-%d %H:%M:%S"), msg)
}

pub struct Session {
    credentials: Credentials,
    report_recipients: Vec<String>,
    transport: Arc<dyn Transport>,
    shell: Arc<dyn Shell>,
    inbound: mpsc::Sender<InboundMessage>,
    link: Mutex<Option<Box<dyn Connection>>>,
}

impl Session {
    /// Create a disconnected session. Messages received on any connection the
    /// session opens are delivered to the returned receiver.
    pub fn new(
        credentials: Credentials,
        report_recipients: Vec<String>,
        transport: Arc<dyn Transport>,
        shell: Arc<dyn Shell>,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound, receiver) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let session = Self {
            credentials,
            report_recipients,
            transport,
            shell,
            inbound,
            link: Mutex::new(None),
        };
        (session, receiver)
    }

    pub fn from_config(
        config: &Config,
        transport: Arc<dyn Transport>,
        shell: Arc<dyn Shell>,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let credentials = Credentials {
            identity: config.login.clone(),
            host: config.server.clone(),
            port: config.server_port,
            secret: config.password.clone(),
        };
        Self::new(credentials, config.report_users.clone(), transport, shell)
    }

    pub fn report_recipients(&self) -> &[String] {
        &self.report_recipients
    }

    /// True iff the live connection reports itself connected
    pub async fn connected(&self) -> bool {
        let link = self.link.lock().await;
        is_live(&link)
    }

    /// Open a fresh connection, replacing any existing one
    pub async fn connect(&self) -> Result<(), SessionError> {
        let mut link = self.link.lock().await;
        self.open(&mut link).await
    }

    /// Connect only if not already connected
    pub async fn ensure_connected(&self) -> bool {
        let mut link = self.link.lock().await;
        self.ensure_live(&mut link).await
    }

    /// Send to a whitespace-separated address list; empty means the report
    /// recipients.
    pub async fn send(&self, to: &str, body: &str) -> Delivery {
        self.deliver(split_addresses(to), body).await
    }

    /// Send to a list of addresses; an empty list means the report recipients.
    pub async fn deliver(&self, to: Vec<String>, body: &str) -> Delivery {
        let recipients = self.resolve_recipients(to);

        let mut link = self.link.lock().await;
        if !self.ensure_live(&mut link).await {
            debug!("not connected, dropping outbound message");
            return Delivery::NotConnected;
        }
        let Some(connection) = link.as_ref() else {
            return Delivery::NotConnected;
        };

        match connection.send_message(&recipients, body).await {
            Ok(()) => Delivery::Sent,
            Err(SessionError::TransportClosed) => Delivery::NotConnected,
            Err(e) => {
                warn!(error = %e, "failed to send message");
                Delivery::Failed
            }
        }
    }

    pub async fn debug(&self, msg: &str) -> Delivery {
        let report = format_report("DEBUG", Local::now(), msg);
        self.deliver(self.report_recipients.clone(), &report).await
    }

    pub async fn notice(&self, msg: &str) -> Delivery {
        let report = format_report("NOTICE", Local::now(), msg);
        self.deliver(self.report_recipients.clone(), &report).await
    }

    /// Say goodbye to the operators and close the connection
    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        let Some(connection) = link.take() else {
            return;
        };

        if connection.is_connected() {
            let farewell = format!("Logged out from {}.", self.credentials.host);
            if let Err(e) = connection
                .send_message(&self.report_recipients, &farewell)
                .await
            {
                warn!(error = %e, "failed to send logout notice");
            }
            let offline = Presence {
                mode: PresenceMode::Offline,
                status: String::new(),
            };
            if let Err(e) = connection.send_presence(&offline).await {
                debug!(error = %e, "failed to publish offline presence");
            }
        }
        connection.close().await;
        info!(server = %self.credentials.host, "session disconnected");
    }

    fn resolve_recipients(&self, to: Vec<String>) -> Vec<String> {
        let recipients: Vec<String> = to.iter().flat_map(|s| split_addresses(s)).collect();
        if recipients.is_empty() {
            self.report_recipients.clone()
        } else {
            recipients
        }
    }

    async fn uptime_status(&self) -> String {
        self.shell.run("uptime").await.trim().to_string()
    }

    async fn ensure_live(&self, link: &mut Option<Box<dyn Connection>>) -> bool {
        if is_live(link) {
            return true;
        }
        self.open(link).await.is_ok()
    }

    async fn open(&self, link: &mut Option<Box<dyn Connection>>) -> Result<(), SessionError> {
        if let Some(stale) = link.take() {
            stale.close().await;
        }

        let connection = match self
            .transport
            .connect(&self.credentials, self.inbound.clone())
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                warn!(
                    login = %self.credentials.identity,
                    server = %self.credentials.host,
                    port = self.credentials.port,
                    error = %e,
                    "failed to connect"
                );
                return Err(e);
            }
        };

        info!(
            login = %self.credentials.identity,
            server = %self.credentials.host,
            port = self.credentials.port,
            "session connected"
        );

        let online = Presence {
            mode: PresenceMode::Available,
            status: self.uptime_status().await,
        };
        if let Err(e) = connection.send_presence(&online).await {
            warn!(error = %e, "failed to publish online presence");
        }

        let greeting = format_report(
            "NOTICE",
            Local::now(),
            &format!(
                "Logged in to {}.\nhostchat agent is available.",
                self.credentials.host
            ),
        );
        if let Err(e) = connection
            .send_message(&self.report_recipients, &greeting)
            .await
        {
            warn!(error = %e, "failed to send startup notice");
        }

        *link = Some(connection);
        Ok(())
    }
}

fn is_live(link: &Option<Box<dyn Connection>>) -> bool {
    link.as_ref()
        .is_some_and(|connection| connection.is_connected())
}

#[async_trait]
impl PresenceSink for Session {
    async fn publish_presence(&self, mode: PresenceMode) -> Delivery {
        let mut link = self.link.lock().await;
        if !self.ensure_live(&mut link).await {
            return Delivery::NotConnected;
        }
        let Some(connection) = link.as_ref() else {
            return Delivery::NotConnected;
        };

        let presence = Presence {
            mode,
            status: self.uptime_status().await,
        };
        match connection.send_presence(&presence).await {
            Ok(()) => Delivery::Sent,
            Err(SessionError::TransportClosed) => Delivery::NotConnected,
            Err(e) => {
                warn!(error = %e, "failed to publish presence");
                Delivery::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::MockShell;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Wire {
        connects: AtomicUsize,
        closes: AtomicUsize,
        refuse: AtomicBool,
        fail_sends: AtomicBool,
        /// Link still reports up but refuses traffic, as while shutting down
        closing: AtomicBool,
        up: Arc<AtomicBool>,
        messages: std::sync::Mutex<Vec<(Vec<String>, String)>>,
        presences: std::sync::Mutex<Vec<Presence>>,
    }

    struct StubTransport {
        wire: Arc<Wire>,
    }

    struct StubConnection {
        wire: Arc<Wire>,
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn connect(
            &self,
            _credentials: &Credentials,
            _inbound: mpsc::Sender<InboundMessage>,
        ) -> Result<Box<dyn Connection>, SessionError> {
            self.wire.connects.fetch_add(1, Ordering::SeqCst);
            if self.wire.refuse.load(Ordering::SeqCst) {
                return Err(SessionError::AuthFailure("not authorized".into()));
            }
            self.wire.up.store(true, Ordering::SeqCst);
            Ok(Box::new(StubConnection {
                wire: self.wire.clone(),
            }))
        }
    }

    #[async_trait]
    impl Connection for StubConnection {
        fn is_connected(&self) -> bool {
            self.wire.up.load(Ordering::SeqCst)
        }

        async fn send_message(&self, to: &[String], body: &str) -> Result<(), SessionError> {
            if self.wire.closing.load(Ordering::SeqCst) {
                return Err(SessionError::TransportClosed);
            }
            if self.wire.fail_sends.load(Ordering::SeqCst) {
                return Err(SessionError::NetworkFailure("broken pipe".into()));
            }
            self.wire
                .messages
                .lock()
                .unwrap()
                .push((to.to_vec(), body.to_string()));
            Ok(())
        }

        async fn send_presence(&self, presence: &Presence) -> Result<(), SessionError> {
            if self.wire.closing.load(Ordering::SeqCst) {
                return Err(SessionError::TransportClosed);
            }
            self.wire.presences.lock().unwrap().push(presence.clone());
            Ok(())
        }

        async fn close(&self) {
            self.wire.closes.fetch_add(1, Ordering::SeqCst);
            self.wire.up.store(false, Ordering::SeqCst);
        }
    }

    fn session(wire: &Arc<Wire>) -> Session {
        let mut shell = MockShell::new();
        shell
            .expect_run()
            .returning(|_| " 10:00:00 up 3 days,  load average: 0.00\n".to_string());
        let credentials = Credentials {
            identity: "bot@host".to_string(),
            host: "chat.host".to_string(),
            port: 5222,
            secret: "secret".to_string(),
        };
        let transport = Arc::new(StubTransport { wire: wire.clone() });
        let (session, _inbound) = Session::new(
            credentials,
            vec!["admin@host".to_string()],
            transport,
            Arc::new(shell),
        );
        session
    }

    fn sent(wire: &Wire) -> Vec<(Vec<String>, String)> {
        wire.messages.lock().unwrap().clone()
    }

    #[test]
    fn test_format_report() {
        let at = Local.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(
            format_report("DEBUG", at, "disk almost full"),
            "[DEBUG] 2024-03-05 07:08:09\ndisk almost full"
        );
    }

    #[tokio::test]
    async fn test_connect_publishes_presence_and_notice() {
        let wire = Arc::new(Wire::default());
        let session = session(&wire);

        session.connect().await.unwrap();

        assert!(session.connected().await);
        let presences = wire.presences.lock().unwrap().clone();
        assert_eq!(presences.len(), 1);
        assert_eq!(presences[0].mode, PresenceMode::Available);
        assert!(presences[0].status.starts_with("10:00:00 up 3 days"));

        let messages = sent(&wire);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, vec!["admin@host".to_string()]);
        assert!(messages[0].1.starts_with("[NOTICE] "));
        assert!(messages[0].1.contains("Logged in to chat.host."));
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned_not_raised() {
        let wire = Arc::new(Wire::default());
        wire.refuse.store(true, Ordering::SeqCst);
        let session = session(&wire);

        let result = session.connect().await;
        assert!(matches!(result, Err(SessionError::AuthFailure(_))));
        assert!(!session.connected().await);
    }

    #[tokio::test]
    async fn test_ensure_connected_is_idempotent() {
        let wire = Arc::new(Wire::default());
        let session = session(&wire);

        assert!(session.ensure_connected().await);
        assert!(session.ensure_connected().await);
        assert!(session.ensure_connected().await);
        assert_eq!(wire.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connected_reflects_transport_state() {
        let wire = Arc::new(Wire::default());
        let session = session(&wire);
        assert!(!session.connected().await);

        session.connect().await.unwrap();
        assert!(session.connected().await);

        // Link drops underneath the session
        wire.up.store(false, Ordering::SeqCst);
        assert!(!session.connected().await);
    }

    #[tokio::test]
    async fn test_send_reconnects_lazily() {
        let wire = Arc::new(Wire::default());
        let session = session(&wire);
        session.connect().await.unwrap();
        wire.up.store(false, Ordering::SeqCst);

        assert_eq!(session.send("alice@host", "ping").await, Delivery::Sent);
        assert_eq!(wire.connects.load(Ordering::SeqCst), 2);
        // Stale connection is released before reconnecting
        assert_eq!(wire.closes.load(Ordering::SeqCst), 1);
        let messages = sent(&wire);
        assert_eq!(
            messages.last().unwrap(),
            &(vec!["alice@host".to_string()], "ping".to_string())
        );
    }

    #[tokio::test]
    async fn test_send_empty_recipient_goes_to_report_users() {
        let wire = Arc::new(Wire::default());
        let session = session(&wire);

        assert_eq!(session.send("", "status").await, Delivery::Sent);
        assert_eq!(session.deliver(Vec::new(), "status2").await, Delivery::Sent);

        let messages = sent(&wire);
        let tail = &messages[messages.len() - 2..];
        assert_eq!(tail[0].0, vec!["admin@host".to_string()]);
        assert_eq!(tail[1].0, vec!["admin@host".to_string()]);
    }

    #[tokio::test]
    async fn test_send_splits_space_separated_recipients() {
        let wire = Arc::new(Wire::default());
        let session = session(&wire);

        session.send("alice@host  bob@host", "hi").await;
        let messages = sent(&wire);
        assert_eq!(
            messages.last().unwrap().0,
            vec!["alice@host".to_string(), "bob@host".to_string()]
        );
    }

    #[tokio::test]
    async fn test_send_when_connect_fails_is_not_connected() {
        let wire = Arc::new(Wire::default());
        wire.refuse.store(true, Ordering::SeqCst);
        let session = session(&wire);

        assert_eq!(session.send("admin@host", "ping").await, Delivery::NotConnected);
        assert!(sent(&wire).is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_is_not_retried() {
        let wire = Arc::new(Wire::default());
        let session = session(&wire);
        session.connect().await.unwrap();
        wire.fail_sends.store(true, Ordering::SeqCst);

        assert_eq!(session.send("alice@host", "ping").await, Delivery::Failed);
        assert_eq!(wire.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_on_closing_transport_is_not_connected() {
        let wire = Arc::new(Wire::default());
        let session = session(&wire);
        session.connect().await.unwrap();
        wire.closing.store(true, Ordering::SeqCst);

        assert!(session.connected().await);
        assert_eq!(session.send("alice@host", "ping").await, Delivery::NotConnected);
        assert_eq!(session.notice("late").await, Delivery::NotConnected);
        assert_eq!(wire.connects.load(Ordering::SeqCst), 1);
        assert_eq!(wire.closes.load(Ordering::SeqCst), 0);
        assert_eq!(sent(&wire).len(), 1);
    }

    #[tokio::test]
    async fn test_presence_on_closing_transport_is_not_connected() {
        let wire = Arc::new(Wire::default());
        let session = session(&wire);
        session.connect().await.unwrap();
        wire.closing.store(true, Ordering::SeqCst);

        assert_eq!(
            session.publish_presence(PresenceMode::Available).await,
            Delivery::NotConnected
        );
        assert_eq!(wire.connects.load(Ordering::SeqCst), 1);
        assert_eq!(wire.presences.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_notice_and_debug_are_tagged() {
        let wire = Arc::new(Wire::default());
        let session = session(&wire);

        session.notice("deploy finished").await;
        session.debug("cache miss").await;

        let messages = sent(&wire);
        let notice = &messages[messages.len() - 2];
        let debug = &messages[messages.len() - 1];
        assert_eq!(notice.0, vec!["admin@host".to_string()]);
        assert!(notice.1.starts_with("[NOTICE] "));
        assert!(notice.1.ends_with("\ndeploy finished"));
        assert!(debug.1.starts_with("[DEBUG] "));
        assert!(debug.1.ends_with("\ncache miss"));
    }

    #[tokio::test]
    async fn test_disconnect_says_goodbye_and_closes() {
        let wire = Arc::new(Wire::default());
        let session = session(&wire);
        session.connect().await.unwrap();

        session.disconnect().await;

        assert!(!session.connected().await);
        assert_eq!(wire.closes.load(Ordering::SeqCst), 1);
        let messages = sent(&wire);
        assert_eq!(messages.last().unwrap().1, "Logged out from chat.host.");
        let presences = wire.presences.lock().unwrap().clone();
        assert_eq!(presences.last().unwrap().mode, PresenceMode::Offline);
    }

    #[tokio::test]
    async fn test_disconnect_when_never_connected_is_noop() {
        let wire = Arc::new(Wire::default());
        let session = session(&wire);
        session.disconnect().await;
        assert_eq!(wire.closes.load(Ordering::SeqCst), 0);
        assert!(sent(&wire).is_empty());
    }

    #[tokio::test]
    async fn test_publish_presence_uses_uptime_status() {
        let wire = Arc::new(Wire::default());
        let session = session(&wire);

        assert_eq!(
            session.publish_presence(PresenceMode::Busy).await,
            Delivery::Sent
        );
        let presences = wire.presences.lock().unwrap().clone();
        let last = presences.last().unwrap();
        assert_eq!(last.mode, PresenceMode::Busy);
        assert_eq!(last.status, "10:00:00 up 3 days,  load average: 0.00");
    }

    #[tokio::test]
    async fn test_publish_presence_when_unreachable() {
        let wire = Arc::new(Wire::default());
        wire.refuse.store(true, Ordering::SeqCst);
        let session = session(&wire);
        assert_eq!(
            session.publish_presence(PresenceMode::Available).await,
            Delivery::NotConnected
        );
    }
}
