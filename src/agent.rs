use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::{CommandTable, Dispatcher};
use crate::config::Config;
use crate::heartbeat::Heartbeat;
use crate::mqtt::MqttTransport;
use crate::session::{Delivery, Session};
use crate::shell::{Shell, SystemShell};
use crate::transport::{InboundMessage, Transport};

/// Composition root: one session, its dispatcher and its heartbeat
pub struct Agent {
    pub config: Config,
    session: Arc<Session>,
    dispatcher: Dispatcher,
    heartbeat: Heartbeat,
    inbound: mpsc::Receiver<InboundMessage>,
}

impl Agent {
    /// Create an agent wired to the given transport and shell
    pub fn new(config: Config, transport: Arc<dyn Transport>, shell: Arc<dyn Shell>) -> Self {
        let (session, inbound) = Session::from_config(&config, transport, shell.clone());
        let session = Arc::new(session);

        let table = CommandTable::builtin(&config.commands);
        let dispatcher = Dispatcher::new(table, shell, config.report_users.clone());

        let heartbeat = Heartbeat::new(
            session.clone(),
            Duration::from_secs(config.heartbeat.interval_secs),
        );

        Self {
            config,
            session,
            dispatcher,
            heartbeat,
            inbound,
        }
    }

    /// Create an agent talking to a real broker and running real commands
    pub fn from_config(config: Config) -> Self {
        let transport = Arc::new(MqttTransport::new(config.transport.clone()));
        let shell = Arc::new(SystemShell::new(
            config.commands.workdir.as_ref().map(PathBuf::from),
            Duration::from_secs(config.commands.shell_timeout_secs),
        ));
        Self::new(config, transport, shell)
    }

    /// Handle to the session for embedding code (`send`, `notice`, `debug`...)
    pub fn session(&self) -> Arc<Session> {
        self.session.clone()
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    /// Dispatch one inbound message and deliver its reply. Messages sent by
    /// the bot itself are ignored and yield `None`.
    pub async fn handle_message(&self, message: &InboundMessage) -> Option<Delivery> {
        if message.from == self.config.login {
            debug!(from = %message.from, "ignoring message from own login");
            return None;
        }
        let reply = self.dispatcher.dispatch(message, self.session.as_ref()).await;
        let delivery = self.session.deliver(reply.to, &reply.body).await;
        if delivery != Delivery::Sent {
            warn!(from = %message.from, delivery = ?delivery, "reply not delivered");
        }
        Some(delivery)
    }

    /// Connect, retrying at the heartbeat interval until the first login
    /// succeeds. Returns false if shut down before connecting.
    async fn login(&self, shutdown: &CancellationToken) -> bool {
        let retry = Duration::from_secs(self.config.heartbeat.interval_secs);
        loop {
            match self.session.connect().await {
                Ok(()) => return true,
                Err(e) => warn!(error = %e, retry_secs = retry.as_secs(), "initial login failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(retry) => {}
            }
        }
    }

    /// Main event loop. Runs until `shutdown` is cancelled, then stops the
    /// heartbeat and logs out.
    pub async fn run(mut self, shutdown: CancellationToken) {
        if !self.login(&shutdown).await {
            info!("shutdown requested before login");
            return;
        }
        self.heartbeat.start().await;
        info!(login = %self.config.login, "agent ready, entering main loop");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = self.inbound.recv() => match message {
                    Some(message) => {
                        self.handle_message(&message).await;
                    }
                    None => break,
                },
            }
        }

        info!("shutting down");
        self.heartbeat.stop().await;
        self.session.disconnect().await;
    }
}
