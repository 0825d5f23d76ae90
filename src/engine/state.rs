use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle of one acquisition run.
///
/// A kernel runs once: `Completed` and `Error` are terminal and a new kernel
/// has to be built from the configuration for the next run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KernelState {
    #[default]
    Idle,
    /// Engine is being configured and the acquisition loop spawned
    Initializing,
    Running {
        #[serde(skip)]
        since: Option<Instant>,
    },
    /// Outputs hold silence, inputs keep acquiring
    Paused {
        #[serde(skip)]
        since: Option<Instant>,
    },
    Completed {
        #[serde(skip)]
        elapsed: Option<Duration>,
        samples_acquired: u64,
    },
    Error {
        message: String,
    },
}

impl KernelState {
    fn accepts(&self, target: &KernelState) -> bool {
        use KernelState::*;

        match self {
            Idle => matches!(target, Initializing),
            Initializing => matches!(target, Running { .. } | Error { .. }),
            Running { .. } => matches!(target, Paused { .. } | Completed { .. } | Error { .. }),
            Paused { .. } => matches!(target, Running { .. } | Completed { .. } | Error { .. }),
            Completed { .. } | Error { .. } => false,
        }
    }

    /// Move to `target`, refusing transitions the lifecycle does not allow
    pub fn advance(&mut self, target: KernelState) -> Result<()> {
        if !self.accepts(&target) {
            bail!("Invalid kernel transition {} -> {}", self, target);
        }
        tracing::debug!(from = self.name(), to = target.name(), "kernel state");
        *self = target;
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Initializing => "Initializing",
            Self::Running { .. } => "Running",
            Self::Paused { .. } => "Paused",
            Self::Completed { .. } => "Completed",
            Self::Error { .. } => "Error",
        }
    }

    /// Acquisition loop alive (running or paused)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running { .. } | Self::Paused { .. })
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }
}

impl fmt::Display for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error { message } => write!(f, "Error({})", message),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> KernelState {
        KernelState::Running { since: None }
    }

    #[test]
    fn test_start_sequence() {
        let mut state = KernelState::default();
        assert!(state.clone().advance(running()).is_err());
        state.advance(KernelState::Initializing).unwrap();
        state.advance(running()).unwrap();
        assert!(state.is_active());
    }

    #[test]
    fn test_pause_resume() {
        let mut state = running();
        state.advance(KernelState::Paused { since: None }).unwrap();
        assert!(state.is_active());
        state.advance(running()).unwrap();
        assert_eq!(state.name(), "Running");
    }

    #[test]
    fn test_finished_states_are_terminal() {
        let mut done = KernelState::Completed {
            elapsed: None,
            samples_acquired: 10,
        };
        assert!(done.is_finished());
        assert!(done.advance(KernelState::Idle).is_err());

        let mut failed = KernelState::Error {
            message: "engine timeout".to_string(),
        };
        let err = failed.advance(KernelState::Initializing).unwrap_err();
        assert!(err.to_string().contains("Error(engine timeout)"));
    }
}
