use crate::core::{Epoch, SampleBlock};
use anyhow::{anyhow, bail, Result};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Subscribers under this name receive every event except raw
/// [`KernelEvent::Acquired`] blocks, which only go to `<input>_acquired`
pub const ANY_EVENT: &str = "*";

/// Everything the acquisition loop reports to the control side
#[derive(Debug, Clone)]
pub enum KernelEvent {
    /// Raw block from an input, only sent when someone listens for it
    Acquired { input: String, block: SampleBlock },

    /// Accepted epochs from one extractor
    Epochs {
        extractor: String,
        output: String,
        epochs: Vec<Epoch>,
    },

    /// The output's signal queue ran out of trials
    QueueEnd { output: String },

    /// Every extractor tied to the output has finished
    Complete { output: String },

    Error { message: String },

    Stopped { samples_acquired: u64 },
}

impl KernelEvent {
    /// Event name subscribers register under
    pub fn name(&self) -> String {
        match self {
            Self::Acquired { input, .. } => format!("{}_acquired", input),
            Self::Epochs { extractor, .. } => format!("{}_epochs", extractor),
            Self::QueueEnd { output } => format!("{}_queue_end", output),
            Self::Complete { output } => format!("{}_complete", output),
            Self::Error { .. } => "kernel_error".to_string(),
            Self::Stopped { .. } => "kernel_stopped".to_string(),
        }
    }
}

pub type Handler = Box<dyn FnMut(&KernelEvent) + Send>;

/// Publish/subscribe registry keyed by event name.
///
/// Delivery is synchronous: handlers for the event name run in registration
/// order, followed by handlers registered for [`ANY_EVENT`]. Raw input blocks
/// skip the wildcard handlers.
#[derive(Default)]
pub struct EventBus {
    handlers: BTreeMap<String, Vec<Handler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        name: impl Into<String>,
        handler: impl FnMut(&KernelEvent) + Send + 'static,
    ) {
        self.handlers
            .entry(name.into())
            .or_default()
            .push(Box::new(handler));
    }

    pub fn has_subscribers(&self, name: &str) -> bool {
        self.handlers.get(name).map(|h| !h.is_empty()).unwrap_or(false)
    }

    /// Deliver an event, returning how many handlers saw it
    pub fn publish(&mut self, event: &KernelEvent) -> usize {
        let name = event.name();
        let wildcard = !matches!(event, KernelEvent::Acquired { .. });
        let mut delivered = 0;
        for key in [name.as_str(), ANY_EVENT] {
            if key == ANY_EVENT && !wildcard {
                continue;
            }
            if let Some(handlers) = self.handlers.get_mut(key) {
                for handler in handlers.iter_mut() {
                    handler(event);
                    delivered += 1;
                }
            }
        }
        if delivered == 0 {
            tracing::trace!(event = %name, "event without subscribers");
        }
        delivered
    }
}

/// Control command addressed as `<target>.<action>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Begin pulling stimuli from the output's queue
    Start(String),
    /// Play silence until started again
    Pause(String),
    /// Run the queue preparation registered for the output
    PrepareQueue(String),
}

impl Command {
    pub fn target(&self) -> &str {
        match self {
            Self::Start(t) | Self::Pause(t) | Self::PrepareQueue(t) => t,
        }
    }
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (target, action) = s
            .rsplit_once('.')
            .ok_or_else(|| anyhow!("Command must look like <target>.<action>: {}", s))?;
        if target.is_empty() {
            bail!("Command has no target: {}", s);
        }
        let target = target.to_string();
        match action {
            "start" => Ok(Self::Start(target)),
            "pause" => Ok(Self::Pause(target)),
            "prepare_queue" => Ok(Self::PrepareQueue(target)),
            other => bail!("Unknown command action: {}", other),
        }
    }
}
