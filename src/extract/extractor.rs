use super::reject::{ArtifactReject, EpochCounts};
use crate::core::{Epoch, EpochRequest, SampleBlock};
use crate::queue::{QueueEvent, SignalQueue, TrialInfo};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractorState {
    /// No pending windows
    Idle,
    /// Accumulating samples for at least one pending window
    Awaiting,
    /// Slicing out completed windows
    Emitting,
    /// Queue drained and every window emitted
    Complete,
}

/// Message from a signal queue subscriber to an extractor
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractorMessage {
    Request(EpochRequest),
    QueueDrained,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Input channel to slice
    #[serde(default)]
    pub channel: usize,

    /// Seconds kept before each onset
    #[serde(default)]
    pub prestim: f64,

    /// Fixed epoch length in seconds; the stimulus duration when unset
    #[serde(default)]
    pub epoch_size: Option<f64>,

    /// Seconds of history retained for windows that start in the past
    #[serde(default = "default_retention")]
    pub retention: f64,

    #[serde(default)]
    pub reject: Option<ArtifactReject>,
}

fn default_retention() -> f64 {
    2.0
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            prestim: 0.0,
            epoch_size: None,
            retention: default_retention(),
            reject: None,
        }
    }
}

/// Map a trial committed on an output at `output_fs` onto an input at `input_fs`
pub fn request_from_trial(info: &TrialInfo, output_fs: f64, input_fs: f64) -> EpochRequest {
    let ratio = input_fs / output_fs;
    EpochRequest {
        start: (info.t0 as f64 * ratio).round() as u64,
        duration: (info.duration as f64 * ratio).round() as usize,
        delay: (info.delay as f64 * ratio).round() as usize,
        key: Some(info.key),
        metadata: info.metadata.clone(),
    }
}

/// Subscriber forwarding a queue's trials to an extractor inbox
pub fn queue_subscriber(
    tx: Sender<ExtractorMessage>,
    output_fs: f64,
    input_fs: f64,
) -> impl FnMut(&QueueEvent) + Send + 'static {
    move |event| {
        let message = match event {
            QueueEvent::Trial(info) => {
                ExtractorMessage::Request(request_from_trial(info, output_fs, input_fs))
            }
            QueueEvent::End => ExtractorMessage::QueueDrained,
        };
        // The extractor may already be torn down
        let _ = tx.send(message);
    }
}

/// Slices requested windows out of a continuous input.
///
/// Windows are matched strictly in the order they were requested and purely
/// by sample offset. A window is emitted as soon as its last sample arrives.
pub struct EpochExtractor {
    fs: f64,
    channel: usize,
    prestim: usize,
    epoch_size: Option<usize>,
    retention: usize,
    reject: Option<ArtifactReject>,

    pending: VecDeque<EpochRequest>,
    history: VecDeque<f64>,
    history_start: u64,
    cursor: Option<u64>,

    state: ExtractorState,
    queue_drained: bool,
    inbox: Option<Receiver<ExtractorMessage>>,
    on_complete: Vec<Box<dyn FnMut() + Send>>,
    counts: BTreeMap<u64, EpochCounts>,
}

impl EpochExtractor {
    pub fn new(fs: f64, config: &ExtractorConfig) -> Self {
        let to_samples = |s: f64| (s * fs).round().max(0.0) as usize;
        Self {
            fs,
            channel: config.channel,
            prestim: to_samples(config.prestim),
            epoch_size: config.epoch_size.map(to_samples),
            retention: to_samples(config.retention),
            reject: config.reject,
            pending: VecDeque::new(),
            history: VecDeque::new(),
            history_start: 0,
            cursor: None,
            state: ExtractorState::Idle,
            queue_drained: false,
            inbox: None,
            on_complete: Vec::new(),
            counts: BTreeMap::new(),
        }
    }

    /// Feed this extractor from every trial `queue` commits
    pub fn connect(&mut self, queue: &mut SignalQueue) {
        let (tx, rx) = unbounded();
        queue.subscribe(queue_subscriber(tx, queue.fs(), self.fs));
        self.inbox = Some(rx);
    }

    /// Receive requests from an existing channel
    pub fn set_inbox(&mut self, inbox: Receiver<ExtractorMessage>) {
        self.inbox = Some(inbox);
    }

    pub fn on_complete(&mut self, callback: impl FnMut() + Send + 'static) {
        self.on_complete.push(Box::new(callback));
    }

    pub fn fs(&self) -> f64 {
        self.fs
    }

    pub fn state(&self) -> ExtractorState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == ExtractorState::Complete
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn counts(&self) -> &BTreeMap<u64, EpochCounts> {
        &self.counts
    }

    /// Queue a window. `request.start` is the stimulus onset; the window
    /// opens `prestim` earlier.
    pub fn add_request(&mut self, mut request: EpochRequest) {
        if self.is_complete() {
            tracing::warn!(start = request.start, "epoch requested after completion, discarded");
            return;
        }
        let duration = self.epoch_size.unwrap_or(request.duration);
        match request.start.checked_sub(self.prestim as u64) {
            Some(start) => {
                request.start = start;
                request.duration = self.prestim + duration;
                self.pending.push_back(request);
                self.queue_drained = false;
                if self.state == ExtractorState::Idle {
                    self.state = ExtractorState::Awaiting;
                }
            }
            None => {
                tracing::warn!(
                    onset = request.start,
                    prestim = self.prestim,
                    "epoch window starts before acquisition, discarded"
                );
            }
        }
    }

    pub fn mark_queue_drained(&mut self) {
        self.queue_drained = true;
        self.check_complete();
    }

    fn drain_inbox(&mut self) {
        let Some(inbox) = self.inbox.take() else {
            return;
        };
        while let Ok(message) = inbox.try_recv() {
            match message {
                ExtractorMessage::Request(request) => self.add_request(request),
                ExtractorMessage::QueueDrained => self.queue_drained = true,
            }
        }
        self.inbox = Some(inbox);
    }

    /// Pick up queued requests without new data; true on the completing call
    pub fn poll(&mut self) -> bool {
        self.drain_inbox();
        self.check_complete()
    }

    fn check_complete(&mut self) -> bool {
        if self.is_complete() || !self.pending.is_empty() {
            return false;
        }
        if !self.queue_drained {
            self.state = ExtractorState::Idle;
            return false;
        }
        self.state = ExtractorState::Complete;
        tracing::info!(counts = ?self.counts, "epoch extraction complete");
        for callback in self.on_complete.iter_mut() {
            callback();
        }
        true
    }

    fn append_history(&mut self, block: &SampleBlock) {
        let samples = block.channel(self.channel);
        let cursor = match self.cursor {
            Some(cursor) => cursor,
            None => {
                self.history_start = block.s0;
                block.s0
            }
        };

        let mut skip = 0usize;
        if block.s0 > cursor {
            let gap = (block.s0 - cursor) as usize;
            tracing::warn!(gap, "gap in input stream, filling with NaN");
            self.history.extend(std::iter::repeat(f64::NAN).take(gap));
        } else if block.s0 < cursor {
            skip = ((cursor - block.s0) as usize).min(samples.len());
        }
        self.history.extend(&samples[skip..]);
        self.cursor = Some(cursor.max(block.end()));
    }

    fn slice(&self, request: &EpochRequest) -> Vec<f64> {
        let first = (request.start - self.history_start) as usize;
        self.history
            .range(first..first + request.duration)
            .copied()
            .collect()
    }

    fn trim_history(&mut self) {
        let cursor = self.cursor.unwrap_or(0);
        let mut keep_from = cursor.saturating_sub(self.retention as u64);
        if let Some(front) = self.pending.front() {
            keep_from = keep_from.min(front.start);
        }
        if keep_from > self.history_start {
            let drop = ((keep_from - self.history_start) as usize).min(self.history.len());
            self.history.drain(..drop);
            self.history_start += drop as u64;
        }
    }

    /// Consume one block and return every epoch it completes, oldest first.
    ///
    /// Rejected epochs are counted but not returned.
    pub fn process(&mut self, block: &SampleBlock) -> Vec<Epoch> {
        self.drain_inbox();
        if !block.is_empty() {
            self.append_history(block);
        }
        let cursor = self.cursor.unwrap_or(0);

        let mut epochs = Vec::new();
        while let Some(front) = self.pending.front() {
            if self.cursor.is_some() && front.start < self.history_start {
                tracing::warn!(
                    start = front.start,
                    retained_from = self.history_start,
                    "epoch window older than retained history, discarded"
                );
                self.pending.pop_front();
                continue;
            }
            if front.end() > cursor || self.cursor.is_none() {
                break;
            }

            self.state = ExtractorState::Emitting;
            let Some(request) = self.pending.pop_front() else {
                break;
            };
            let samples = self.slice(&request);
            let accepted = self
                .reject
                .map(|reject| reject.accepts(&samples))
                .unwrap_or(true);
            if let Some(key) = request.key {
                let counts = self.counts.entry(key).or_default();
                if accepted {
                    counts.valid += 1;
                } else {
                    counts.rejected += 1;
                }
            }
            if accepted {
                epochs.push(Epoch {
                    start: request.start,
                    fs: self.fs,
                    key: request.key,
                    metadata: request.metadata,
                    samples,
                });
            } else {
                tracing::debug!(start = request.start, key = ?request.key, "epoch rejected");
            }
        }

        self.trim_history();
        if self.pending.is_empty() {
            self.check_complete();
        } else {
            self.state = ExtractorState::Awaiting;
        }
        epochs
    }

    /// Tear down, returning windows that were never satisfied
    pub fn finish(&mut self) -> Vec<EpochRequest> {
        self.drain_inbox();
        let discarded: Vec<EpochRequest> = self.pending.drain(..).collect();
        if !discarded.is_empty() {
            tracing::debug!(count = discarded.len(), "discarding incomplete epoch windows");
        }
        self.history.clear();
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Metadata;
    use crate::extract::RejectMode;

    fn ramp_block(s0: u64, n: usize) -> SampleBlock {
        SampleBlock::mono(s0, 1000.0, (s0..s0 + n as u64).map(|v| v as f64).collect())
    }

    #[test]
    fn test_prestim_opens_window_early() {
        let config = ExtractorConfig {
            prestim: 0.01,
            epoch_size: Some(0.02),
            ..Default::default()
        };
        let mut ex = EpochExtractor::new(1000.0, &config);
        ex.add_request(EpochRequest::new(100, 5, Metadata::new()));
        let epochs = ex.process(&ramp_block(0, 200));
        assert_eq!(epochs.len(), 1);
        assert_eq!(epochs[0].start, 90);
        assert_eq!(epochs[0].duration(), 30);
        assert_eq!(epochs[0].samples[0], 90.0);
    }

    #[test]
    fn test_gap_filled_with_nan() {
        let mut ex = EpochExtractor::new(1000.0, &ExtractorConfig::default());
        ex.add_request(EpochRequest::new(5, 10, Metadata::new()));
        ex.process(&ramp_block(0, 8));
        let epochs = ex.process(&ramp_block(12, 8));
        assert_eq!(epochs.len(), 1);
        let s = &epochs[0].samples;
        assert_eq!(s[0], 5.0);
        assert!(s[3..7].iter().all(|v| v.is_nan()));
        assert_eq!(s[7], 12.0);
    }

    #[test]
    fn test_window_older_than_history_discarded() {
        let config = ExtractorConfig {
            retention: 0.01,
            ..Default::default()
        };
        let mut ex = EpochExtractor::new(1000.0, &config);
        ex.process(&ramp_block(0, 100));
        ex.add_request(EpochRequest::new(10, 5, Metadata::new()));
        ex.add_request(EpochRequest::new(95, 5, Metadata::new()));
        let epochs = ex.process(&ramp_block(100, 10));
        assert_eq!(epochs.len(), 1);
        assert_eq!(epochs[0].start, 95);
    }

    #[test]
    fn test_rejection_counts_per_key() {
        let config = ExtractorConfig {
            reject: Some(ArtifactReject {
                mode: RejectMode::Absolute,
                threshold: 50.0,
                detrend: false,
            }),
            ..Default::default()
        };
        let mut ex = EpochExtractor::new(1000.0, &config);
        let mut clean = EpochRequest::new(0, 10, Metadata::new());
        clean.key = Some(7);
        let mut noisy = EpochRequest::new(60, 10, Metadata::new());
        noisy.key = Some(7);
        ex.add_request(clean);
        ex.add_request(noisy);
        let epochs = ex.process(&ramp_block(0, 100));
        assert_eq!(epochs.len(), 1);
        assert_eq!(
            ex.counts()[&7],
            EpochCounts {
                valid: 1,
                rejected: 1
            }
        );
    }
}
