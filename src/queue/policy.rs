use serde::{Deserialize, Serialize};

/// Order in which queue entries deliver their trials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "group_size", rename_all = "snake_case")]
pub enum QueuePolicy {
    /// One entry until its budget is spent, then the next
    Fifo,

    /// One trial from each live entry in turn
    InterleavedFifo,

    /// The first `k` live entries rotate in lock-step; when one is spent the
    /// next entry in line takes its place
    Grouped(usize),
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::Fifo
    }
}

impl QueuePolicy {
    /// Index of the entry delivering the next trial.
    ///
    /// `last` is the index of the entry that delivered the previous trial,
    /// already adjusted for removals; `len` is the number of live entries and
    /// must be non-zero.
    pub fn next_index(&self, last: Option<usize>, len: usize) -> usize {
        let window = match self {
            QueuePolicy::Fifo => return 0,
            QueuePolicy::InterleavedFifo => len,
            QueuePolicy::Grouped(k) => (*k).min(len).max(1),
        };
        match last {
            Some(last) => (last + 1) % window,
            None => 0,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let QueuePolicy::Grouped(0) = self {
            anyhow::bail!("Grouped queue needs a group size of at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_always_head() {
        assert_eq!(QueuePolicy::Fifo.next_index(Some(3), 5), 0);
    }

    #[test]
    fn test_interleaved_wraps() {
        let p = QueuePolicy::InterleavedFifo;
        assert_eq!(p.next_index(None, 3), 0);
        assert_eq!(p.next_index(Some(0), 3), 1);
        assert_eq!(p.next_index(Some(2), 3), 0);
    }

    #[test]
    fn test_grouped_stays_in_window() {
        let p = QueuePolicy::Grouped(2);
        assert_eq!(p.next_index(Some(0), 4), 1);
        assert_eq!(p.next_index(Some(1), 4), 0);
        assert_eq!(p.next_index(Some(0), 1), 0);
    }

    #[test]
    fn test_policy_json() {
        let p: QueuePolicy = serde_json::from_str(r#"{"type":"grouped","group_size":2}"#).unwrap();
        assert_eq!(p, QueuePolicy::Grouped(2));
        let p: QueuePolicy = serde_json::from_str(r#"{"type":"interleaved_fifo"}"#).unwrap();
        assert_eq!(p, QueuePolicy::InterleavedFifo);
        assert!(QueuePolicy::Grouped(0).validate().is_err());
    }
}
