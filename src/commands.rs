use std::sync::Arc;
use tracing::{info, warn};

use crate::config::CommandsConfig;
use crate::session::{Delivery, PresenceSink};
use crate::shell::Shell;
use crate::transport::{InboundMessage, PresenceMode};

/// What a command literal does when it fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run a fixed command line and echo its output
    RunShell { cmdline: String },
    /// Re-publish presence with the given mode
    SetPresence { mode: PresenceMode },
    /// Answer with fixed text
    Reply { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEntry {
    pub literal: String,
    pub action: Action,
}

impl CommandEntry {
    pub fn new(literal: impl Into<String>, action: Action) -> Self {
        Self {
            literal: literal.into(),
            action,
        }
    }

    pub fn shell(literal: impl Into<String>, cmdline: impl Into<String>) -> Self {
        Self::new(
            literal,
            Action::RunShell {
                cmdline: cmdline.into(),
            },
        )
    }
}

/// Closed, ordered set of operator commands. Built once at startup.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    entries: Vec<CommandEntry>,
}

impl CommandTable {
    pub fn new(entries: Vec<CommandEntry>) -> Self {
        Self { entries }
    }

    /// The standard operator command set
    pub fn builtin(config: &CommandsConfig) -> Self {
        let restart = match &config.restart_url {
            Some(url) => format!("touch tmp/restart.txt; wget --spider '{}' 2>&1", url),
            None => "touch tmp/restart.txt".to_string(),
        };

        let mut entries = vec![
            CommandEntry::new(
                "@presence normal",
                Action::SetPresence {
                    mode: PresenceMode::Normal,
                },
            ),
            CommandEntry::new(
                "@presence busy",
                Action::SetPresence {
                    mode: PresenceMode::Busy,
                },
            ),
            CommandEntry::shell("@ps", "ps aux"),
            CommandEntry::shell("@free", "free"),
            CommandEntry::shell("@whoami", "whoami"),
            CommandEntry::shell("@pwd", "pwd"),
            CommandEntry::shell("@hostname", "hostname"),
            CommandEntry::shell("@ifconfig", "ifconfig"),
            CommandEntry::shell("@vmstat", "vmstat"),
            CommandEntry::shell("@uptime", "uptime"),
            CommandEntry::shell("@apache status", "apache2ctl status"),
            CommandEntry::shell("@app about", "script/about"),
            CommandEntry::shell("@app restart", restart),
            CommandEntry::shell("@rake routes", "rake routes"),
        ];

        let mut help = String::from("available commands:");
        for entry in &entries {
            help.push('\n');
            help.push_str(&entry.literal);
        }
        help.push_str("\n@help");
        entries.push(CommandEntry::new("@help", Action::Reply { text: help }));

        Self::new(entries)
    }

    /// Exact match against the literals, no prefix or pattern matching
    pub fn lookup(&self, command: &str) -> Option<&Action> {
        self.entries
            .iter()
            .find(|entry| entry.literal == command)
            .map(|entry| &entry.action)
    }

    pub fn entries(&self) -> &[CommandEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A reply produced for one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReply {
    pub to: Vec<String>,
    pub body: String,
}

/// Routes inbound messages through the command table
pub struct Dispatcher {
    table: CommandTable,
    shell: Arc<dyn Shell>,
    report_recipients: Vec<String>,
}

impl Dispatcher {
    pub fn new(table: CommandTable, shell: Arc<dyn Shell>, report_recipients: Vec<String>) -> Self {
        Self {
            table,
            shell,
            report_recipients,
        }
    }

    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    /// Produce exactly one reply for an inbound message
    pub async fn dispatch(
        &self,
        message: &InboundMessage,
        presence: &dyn PresenceSink,
    ) -> OutboundReply {
        if message.is_error {
            warn!(from = %message.from, "protocol error reported");
            return OutboundReply {
                to: self.report_recipients.clone(),
                body: format!("Sorry, an error occurred\n{}", message.body),
            };
        }

        let command = message.body.trim();
        let Some(action) = self.table.lookup(command) else {
            info!(from = %message.from, "relaying unrecognized message to operator");
            return OutboundReply {
                to: self.report_recipients.clone(),
                body: format!(">>Message from {}\n\"{}\"", message.from, message.body),
            };
        };

        info!(from = %message.from, command = %command, "received command");
        let output = match action {
            Action::RunShell { cmdline } => self.shell.run(cmdline).await,
            Action::SetPresence { mode } => {
                if presence.publish_presence(*mode).await != Delivery::Sent {
                    warn!(command = %command, "presence change was not delivered");
                }
                format!("presence to {}", mode.label())
            }
            Action::Reply { text } => text.clone(),
        };

        OutboundReply {
            to: vec![message.from.clone()],
            body: format!(">>{}\n{}", command, output),
        }
    }
}
