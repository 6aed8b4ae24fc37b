//! Named mailboxes over unbounded tokio channels, plus the single-threaded service loop
//!
//! Sending never waits on the receiver; services post to each other in a cycle.

use crate::error::PipelineError;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const EVALUATOR: &str = "evaluator";
pub const CRAWLER: &str = "crawler";
pub const PROMPT: &str = "prompt";
pub const PROFILE: &str = "profile";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Evaluation,
    ScrapeRequest,
    ScrapeResult,
    Prompt,
    Params,
    Interaction,
    Final,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Evaluation => "evaluation",
            Phase::ScrapeRequest => "scrape_request",
            Phase::ScrapeResult => "scrape_result",
            Phase::Prompt => "prompt",
            Phase::Params => "params",
            Phase::Interaction => "interaction",
            Phase::Final => "final",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged message; the body is JSON and parsed by the receiving service
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub phase: Phase,
    pub body: String,
    /// Where the eventual answer should go, when it differs from `from`
    pub reply_to: Option<String>,
}

impl Envelope {
    pub fn new<T: Serialize>(from: &str, to: &str, phase: Phase, payload: &T) -> Result<Self> {
        Ok(Self {
            from: from.to_string(),
            to: to.to_string(),
            phase,
            body: serde_json::to_string(payload)?,
            reply_to: None,
        })
    }

    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    /// Parse the body, reporting malformed payloads as a typed error
    pub fn parse<T: for<'de> Deserialize<'de>>(&self) -> Result<T, PipelineError> {
        serde_json::from_str(&self.body).map_err(|source| PipelineError::MalformedPayload {
            phase: self.phase.as_str(),
            source,
        })
    }

    /// Explicit reply address, else the sender
    pub fn originator(&self) -> &str {
        self.reply_to.as_deref().unwrap_or(&self.from)
    }
}

/// Registry of live mailboxes
#[derive(Clone, Default)]
pub struct PostOffice {
    routes: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Envelope>>>>,
}

impl PostOffice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) the mailbox for `address`
    pub fn register(&self, address: impl Into<String>) -> Mailbox {
        let address = address.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = match self.routes.write() {
            Ok(routes) => routes,
            Err(poisoned) => poisoned.into_inner(),
        };
        if routes.insert(address.clone(), tx).is_some() {
            warn!("Mailbox '{}' re-registered; previous receiver detached", address);
        }
        Mailbox { address, rx }
    }

    pub fn unregister(&self, address: &str) {
        let mut routes = match self.routes.write() {
            Ok(routes) => routes,
            Err(poisoned) => poisoned.into_inner(),
        };
        routes.remove(address);
    }

    /// Queue `envelope` for its address without waiting
    pub fn send(&self, envelope: Envelope) -> Result<(), PipelineError> {
        let sender = {
            let routes = match self.routes.read() {
                Ok(routes) => routes,
                Err(poisoned) => poisoned.into_inner(),
            };
            routes.get(&envelope.to).cloned()
        };
        let Some(sender) = sender else {
            return Err(PipelineError::UnknownAddress(envelope.to));
        };
        let to = envelope.to.clone();
        debug!("{} -> {} [{}]", envelope.from, to, envelope.phase);
        sender
            .send(envelope)
            .map_err(|_| PipelineError::MailboxClosed(to))
    }
}

/// Receiving end of one address
pub struct Mailbox {
    address: String,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

#[derive(Debug)]
pub enum Received {
    Message(Envelope),
    Idle,
    Closed,
}

impl Mailbox {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Wait up to `timeout` for the next message
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Received {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(envelope)) => Received::Message(envelope),
            Ok(None) => Received::Closed,
            Err(_) => Received::Idle,
        }
    }
}

/// A logical agent: handles one message at a time to completion
#[async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;

    async fn handle(&mut self, envelope: Envelope) -> Result<()>;

    /// Called after each receive timeout and each handled message
    async fn on_idle(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drive a service until its mailbox closes. Handler errors are logged, never fatal.
pub async fn run_service<S: Service>(mut service: S, mut mailbox: Mailbox, receive_timeout: Duration) {
    info!("{} listening on '{}'", service.name(), mailbox.address());
    loop {
        match mailbox.recv_timeout(receive_timeout).await {
            Received::Message(envelope) => {
                let phase = envelope.phase;
                if let Err(e) = service.handle(envelope).await {
                    error!("{}: failed handling {} message: {:#}", service.name(), phase, e);
                }
            }
            Received::Idle => {}
            Received::Closed => break,
        }
        if let Err(e) = service.on_idle().await {
            error!("{}: idle tick failed: {:#}", service.name(), e);
        }
    }
    info!("{} stopped", service.name());
}
