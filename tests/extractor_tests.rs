use crossbeam_channel::unbounded;
use evokedlab::core::{EpochRequest, Metadata, SampleBlock};
use evokedlab::extract::{
    ArtifactReject, EpochExtractor, ExtractorConfig, ExtractorMessage, ExtractorState, RejectMode,
};
use evokedlab::queue::{Delays, QueuePolicy, SignalQueue, Source};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const FS: f64 = 1000.0;

fn ramp(s0: u64, n: usize) -> SampleBlock {
    SampleBlock::mono(s0, FS, (s0..s0 + n as u64).map(|v| v as f64).collect())
}

#[test]
fn test_window_emitted_on_its_last_sample() {
    let mut extractor = EpochExtractor::new(FS, &ExtractorConfig::default());
    extractor.add_request(EpochRequest::new(1000, 500, Metadata::new()));
    assert_eq!(extractor.state(), ExtractorState::Awaiting);

    for s0 in (0..1400).step_by(100) {
        assert!(extractor.process(&ramp(s0, 100)).is_empty(), "early at {}", s0);
    }
    let epochs = extractor.process(&ramp(1400, 100));
    assert_eq!(epochs.len(), 1);
    assert_eq!(epochs[0].start, 1000);
    assert_eq!(epochs[0].samples.len(), 500);
    assert_eq!(epochs[0].samples[0], 1000.0);
    assert_eq!(epochs[0].samples[499], 1499.0);
}

#[test]
fn test_completion_fires_once() {
    let (tx, rx) = unbounded();
    let mut extractor = EpochExtractor::new(FS, &ExtractorConfig::default());
    extractor.set_inbox(rx);
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    extractor.on_complete(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    tx.send(ExtractorMessage::Request(EpochRequest::new(10, 20, Metadata::new())))
        .unwrap();
    tx.send(ExtractorMessage::QueueDrained).unwrap();

    assert_eq!(extractor.process(&ramp(0, 20)).len(), 0);
    assert!(!extractor.is_complete());
    assert_eq!(extractor.process(&ramp(20, 20)).len(), 1);
    assert!(extractor.is_complete());

    extractor.process(&ramp(40, 20));
    assert!(!extractor.poll());
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Late requests are refused
    extractor.add_request(EpochRequest::new(100, 5, Metadata::new()));
    assert_eq!(extractor.pending(), 0);
}

#[test]
fn test_windows_follow_queue_at_another_rate() {
    let mut queue = SignalQueue::new(2.0 * FS, QueuePolicy::Fifo);
    let config = ExtractorConfig {
        prestim: 0.002,
        ..Default::default()
    };
    let mut extractor = EpochExtractor::new(FS, &config);
    extractor.connect(&mut queue);

    let metadata = Metadata::from([("level".to_string(), 80.0.into())]);
    queue
        .append(Source::samples(vec![1.0; 20]), 2, Delays::Constant(0.01), metadata)
        .unwrap();

    // Onsets 0 and 40 at 2 kHz land on 0 and 20 at 1 kHz; the first window
    // would open before sample zero
    queue.pop_buffer(80);
    let epochs = extractor.process(&ramp(0, 40));
    assert_eq!(epochs.len(), 1);
    assert_eq!(epochs[0].start, 18);
    assert_eq!(epochs[0].samples.len(), 12);
    assert_eq!(epochs[0].metadata["level"], 80.0);
}

#[test]
fn test_first_window_before_acquisition_discarded() {
    let config = ExtractorConfig {
        prestim: 0.005,
        ..Default::default()
    };
    let mut extractor = EpochExtractor::new(FS, &config);
    extractor.add_request(EpochRequest::new(2, 10, Metadata::new()));
    extractor.add_request(EpochRequest::new(10, 10, Metadata::new()));
    assert_eq!(extractor.pending(), 1);
    let epochs = extractor.process(&ramp(0, 30));
    assert_eq!(epochs[0].start, 5);
}

#[test]
fn test_rejected_epochs_counted_not_returned() {
    let config = ExtractorConfig {
        reject: Some(ArtifactReject {
            mode: RejectMode::Absolute,
            threshold: 50.0,
            detrend: false,
        }),
        ..Default::default()
    };
    let mut extractor = EpochExtractor::new(FS, &config);
    let mut clean = EpochRequest::new(0, 10, Metadata::new());
    clean.key = Some(7);
    let mut noisy = EpochRequest::new(60, 10, Metadata::new());
    noisy.key = Some(7);
    extractor.add_request(clean);
    extractor.add_request(noisy);

    let epochs = extractor.process(&ramp(0, 100));
    assert_eq!(epochs.len(), 1);
    let counts = extractor.counts()[&7];
    assert_eq!((counts.valid, counts.rejected), (1, 1));
}
