use super::policy::QueuePolicy;
use super::waveform::WaveformFactory;
use crate::core::Metadata;
use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stimulus behind a queue entry
pub enum Source {
    /// Pre-rendered samples, shared between trials
    Samples(Arc<Vec<f64>>),

    /// Rendered anew for every trial
    Factory(Box<dyn WaveformFactory>),
}

impl Source {
    pub fn samples(samples: Vec<f64>) -> Self {
        Source::Samples(Arc::new(samples))
    }

    pub fn factory(factory: impl WaveformFactory + 'static) -> Self {
        Source::Factory(Box::new(factory))
    }

    fn n_samples(&self, fs: f64) -> usize {
        match self {
            Source::Samples(s) => s.len(),
            Source::Factory(f) => f.n_samples(fs),
        }
    }
}

/// Silence following each trial, in seconds
#[derive(Debug, Clone, PartialEq)]
pub enum Delays {
    Constant(f64),
    /// Cycled by trial number
    PerTrial(Vec<f64>),
}

impl Default for Delays {
    fn default() -> Self {
        Delays::Constant(0.0)
    }
}

impl Delays {
    fn samples(&self, trial: usize, fs: f64) -> usize {
        let seconds = match self {
            Delays::Constant(d) => *d,
            Delays::PerTrial(d) if d.is_empty() => 0.0,
            Delays::PerTrial(d) => d[trial % d.len()],
        };
        (seconds * fs).round().max(0.0) as usize
    }

    fn validate(&self) -> Result<()> {
        let bad = match self {
            Delays::Constant(d) => !(*d >= 0.0),
            Delays::PerTrial(d) => d.iter().any(|d| !(*d >= 0.0)),
        };
        if bad {
            bail!("Inter-trial delays must be finite and non-negative");
        }
        Ok(())
    }
}

struct Entry {
    key: u64,
    source: Source,
    requested: usize,
    remaining: usize,
    presented: usize,
    delays: Delays,
    metadata: Metadata,
}

/// Timing of one emitted trial, in samples of the queue's output
#[derive(Debug, Clone, PartialEq)]
pub struct TrialInfo {
    pub key: u64,
    /// First sample of the stimulus
    pub t0: u64,
    /// Stimulus length
    pub duration: usize,
    /// Silence after the stimulus
    pub delay: usize,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Trial(TrialInfo),
    /// Every entry is spent; sent once per transition to drained
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// Nothing appended yet, more may arrive
    Empty,
    Active,
    /// Entries existed and are all exhausted
    Drained,
}

enum QueueCommand {
    Append(Entry),
    Decrement(u64),
    Cancel,
}

pub type Subscriber = Box<dyn FnMut(&QueueEvent) + Send>;

/// Control-side handle for appending to a queue owned by the acquisition loop.
///
/// Commands are applied in order the next time the queue is counted or popped.
#[derive(Clone)]
pub struct QueueAppender {
    fs: f64,
    tx: Sender<QueueCommand>,
    next_key: Arc<AtomicU64>,
}

impl QueueAppender {
    pub fn append(
        &self,
        source: Source,
        trials: usize,
        delays: Delays,
        metadata: Metadata,
    ) -> Result<u64> {
        let entry = new_entry(&self.next_key, self.fs, source, trials, delays, metadata)?;
        let key = entry.key;
        self.tx
            .send(QueueCommand::Append(entry))
            .map_err(|_| anyhow!("Signal queue has been dropped"))?;
        Ok(key)
    }

    pub fn decrement_key(&self, key: u64) -> Result<()> {
        self.tx
            .send(QueueCommand::Decrement(key))
            .map_err(|_| anyhow!("Signal queue has been dropped"))
    }

    pub fn cancel(&self) -> Result<()> {
        self.tx
            .send(QueueCommand::Cancel)
            .map_err(|_| anyhow!("Signal queue has been dropped"))
    }
}

fn new_entry(
    next_key: &AtomicU64,
    fs: f64,
    source: Source,
    trials: usize,
    delays: Delays,
    metadata: Metadata,
) -> Result<Entry> {
    delays.validate()?;
    if let Source::Factory(factory) = &source {
        factory.validate(fs)?;
    }
    Ok(Entry {
        key: next_key.fetch_add(1, Ordering::Relaxed),
        source,
        requested: trials,
        remaining: trials,
        presented: 0,
        delays,
        metadata,
    })
}

/// Delivers queued stimuli to one output as a continuous sample stream.
pub struct SignalQueue {
    fs: f64,
    policy: QueuePolicy,
    auto_decrement: bool,
    entries: Vec<Entry>,
    last: Option<usize>,
    next_key: Arc<AtomicU64>,
    tx: Sender<QueueCommand>,
    rx: Receiver<QueueCommand>,
    subscribers: Vec<Subscriber>,
    pending: VecDeque<f64>,
    offset: u64,
    requested: usize,
    had_entries: bool,
    drained: bool,
}

impl SignalQueue {
    pub fn new(fs: f64, policy: QueuePolicy) -> Self {
        let (tx, rx) = unbounded();
        Self {
            fs,
            policy,
            auto_decrement: true,
            entries: Vec::new(),
            last: None,
            next_key: Arc::new(AtomicU64::new(0)),
            tx,
            rx,
            subscribers: Vec::new(),
            pending: VecDeque::new(),
            offset: 0,
            requested: 0,
            had_entries: false,
            drained: false,
        }
    }

    /// With auto-decrement off, entries keep presenting until their budget
    /// is spent through [`SignalQueue::decrement_key`]
    pub fn with_auto_decrement(mut self, auto_decrement: bool) -> Self {
        self.auto_decrement = auto_decrement;
        self
    }

    pub fn fs(&self) -> f64 {
        self.fs
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    pub fn auto_decrement(&self) -> bool {
        self.auto_decrement
    }

    /// Samples handed out so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Move the output position, e.g. when playback resumes after a pause.
    /// Refused while rendered samples are still waiting to play.
    pub fn align(&mut self, offset: u64) {
        if self.offset == offset {
            return;
        }
        if !self.pending.is_empty() {
            tracing::warn!(offset, queue_offset = self.offset, "queue has samples pending, not realigning");
            return;
        }
        self.offset = offset;
    }

    pub fn appender(&self) -> QueueAppender {
        QueueAppender {
            fs: self.fs,
            tx: self.tx.clone(),
            next_key: self.next_key.clone(),
        }
    }

    /// Subscribers are called synchronously, in registration order, as each
    /// trial is committed to the output
    pub fn subscribe(&mut self, callback: impl FnMut(&QueueEvent) + Send + 'static) {
        self.subscribers.push(Box::new(callback));
    }

    pub fn append(
        &mut self,
        source: Source,
        trials: usize,
        delays: Delays,
        metadata: Metadata,
    ) -> Result<u64> {
        let entry = new_entry(&self.next_key, self.fs, source, trials, delays, metadata)?;
        let key = entry.key;
        self.insert(entry);
        Ok(key)
    }

    fn insert(&mut self, entry: Entry) {
        self.requested += entry.requested;
        if entry.remaining > 0 {
            self.entries.push(entry);
            self.had_entries = true;
            self.drained = false;
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            match command {
                QueueCommand::Append(entry) => self.insert(entry),
                QueueCommand::Decrement(key) => self.decrement_key(key),
                QueueCommand::Cancel => self.cancel(),
            }
        }
    }

    fn remove(&mut self, index: usize) {
        self.entries.remove(index);
        if let Some(last) = self.last {
            if index <= last {
                self.last = last.checked_sub(1);
            }
        }
    }

    /// Count one accepted trial against `key`, removing the entry when spent
    pub fn decrement_key(&mut self, key: u64) {
        match self.entries.iter().position(|e| e.key == key) {
            Some(index) => {
                let entry = &mut self.entries[index];
                entry.remaining = entry.remaining.saturating_sub(1);
                if entry.remaining == 0 {
                    self.remove(index);
                }
            }
            None => tracing::debug!(key, "decrement for an entry no longer queued"),
        }
    }

    /// Drop every remaining entry; samples already rendered still play out
    pub fn cancel(&mut self) {
        self.entries.clear();
        self.last = None;
    }

    pub fn status(&mut self) -> QueueStatus {
        self.drain_commands();
        if !self.entries.is_empty() {
            QueueStatus::Active
        } else if self.had_entries {
            QueueStatus::Drained
        } else {
            QueueStatus::Empty
        }
    }

    /// Total trials ever requested, for progress tracking
    pub fn count_requested_trials(&mut self) -> usize {
        self.drain_commands();
        self.requested
    }

    /// Trials still to be delivered across live entries
    pub fn count_trials(&mut self) -> usize {
        self.drain_commands();
        self.entries.iter().map(|e| e.remaining).sum()
    }

    pub fn remaining_trials(&mut self, key: u64) -> Option<usize> {
        self.drain_commands();
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.remaining)
    }

    fn notify(&mut self, event: QueueEvent) {
        for subscriber in self.subscribers.iter_mut() {
            subscriber(&event);
        }
    }

    /// Render the next trial into the pending buffer; false when nothing is left
    fn commit_trial(&mut self) -> bool {
        if self.entries.is_empty() {
            if self.had_entries && !self.drained {
                self.drained = true;
                tracing::debug!(offset = self.offset, "signal queue drained");
                self.notify(QueueEvent::End);
            }
            return false;
        }

        let index = self.policy.next_index(self.last, self.entries.len());
        self.last = Some(index);
        let fs = self.fs;
        let entry = &mut self.entries[index];

        let waveform: Vec<f64> = match &mut entry.source {
            Source::Samples(samples) => samples.to_vec(),
            Source::Factory(factory) => match factory.render(fs) {
                Ok(samples) => samples,
                Err(e) => {
                    tracing::error!(key = entry.key, error = %e, "stimulus render failed, playing silence");
                    vec![0.0; factory.n_samples(fs)]
                }
            },
        };
        let delay = entry.delays.samples(entry.presented, fs);
        entry.presented += 1;

        let info = TrialInfo {
            key: entry.key,
            t0: self.offset + self.pending.len() as u64,
            duration: waveform.len(),
            delay,
            metadata: entry.metadata.clone(),
        };

        if self.auto_decrement {
            entry.remaining -= 1;
            if entry.remaining == 0 {
                self.remove(index);
            }
        }

        self.pending.extend(waveform);
        self.pending.extend(std::iter::repeat(0.0).take(delay));
        self.notify(QueueEvent::Trial(info));
        true
    }

    /// Next `n` samples of output, padded with silence once the queue is spent
    pub fn pop_buffer(&mut self, n: usize) -> Vec<f64> {
        self.drain_commands();

        // Zero-length trials with no delay never advance the output
        let mut stalled = 0;
        while self.pending.len() < n {
            let before = self.pending.len();
            if !self.commit_trial() {
                break;
            }
            if self.pending.len() == before {
                stalled += 1;
                if stalled > self.entries.len() {
                    tracing::warn!("queue entries produce no samples, padding with silence");
                    break;
                }
            } else {
                stalled = 0;
            }
        }

        let take = n.min(self.pending.len());
        let mut out: Vec<f64> = self.pending.drain(..take).collect();
        out.resize(n, 0.0);
        self.offset += n as u64;
        out
    }

    /// Length of the trial `key` would render next, if still queued
    pub fn trial_samples(&self, key: u64) -> Option<usize> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.source.n_samples(self.fs))
    }
}
