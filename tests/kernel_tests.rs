use anyhow::Result;
use evokedlab::core::{Epoch, Metadata};
use evokedlab::engine::{
    acquire_epochs, AcquisitionKernel, EpochAcquisition, ExtractorBinding, KernelEvent, StageGraph,
    ANY_EVENT,
};
use evokedlab::extract::{ArtifactReject, ExtractorConfig, RejectMode};
use evokedlab::hal::{ChannelConfig, EngineConfig, LoopbackSettings, SimulatedEngine};
use evokedlab::queue::{Delays, QueuePolicy, Source, WaveformFactory};
use evokedlab::store::ContinuousReader;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const FS: f64 = 1000.0;

fn engine_config() -> EngineConfig {
    EngineConfig {
        monitor_period: 0.01,
        buffer_size: 0.02,
        channels: vec![
            ChannelConfig::output("speaker", FS),
            ChannelConfig::input("microphone", FS),
        ],
    }
}

fn engine(gain: f64) -> Box<SimulatedEngine> {
    Box::new(SimulatedEngine::new(LoopbackSettings {
        gain,
        ..Default::default()
    }))
}

fn epoch_config() -> ExtractorConfig {
    ExtractorConfig {
        epoch_size: Some(0.01),
        ..Default::default()
    }
}

fn collect_epochs(kernel: &mut AcquisitionKernel, extractor: &str) -> Arc<Mutex<Vec<Epoch>>> {
    let epochs = Arc::new(Mutex::new(Vec::new()));
    let sink = epochs.clone();
    kernel.subscribe(format!("{}_epochs", extractor), move |event| {
        if let KernelEvent::Epochs { epochs, .. } = event {
            sink.lock().unwrap().extend(epochs.iter().cloned());
        }
    });
    epochs
}

#[tokio::test]
async fn test_loopback_epochs_and_events() -> Result<()> {
    let mut kernel = AcquisitionKernel::new(engine(0.5), engine_config())?;
    let appender = kernel.add_output("speaker", QueuePolicy::Fifo, true)?;
    kernel.add_input("microphone", StageGraph::new())?;
    kernel.add_extractor(
        ExtractorBinding::new("mic", "microphone", "speaker").with_config(epoch_config()),
    )?;

    let metadata = Metadata::from([("level".to_string(), 60.0.into())]);
    let key = appender.append(Source::samples(vec![1.0; 10]), 3, Delays::Constant(0.01), metadata)?;

    let epochs = collect_epochs(&mut kernel, "mic");
    let names = Arc::new(Mutex::new(Vec::new()));
    let seen = names.clone();
    kernel.subscribe(ANY_EVENT, move |event| seen.lock().unwrap().push(event.name()));

    kernel.invoke("speaker.start")?;
    kernel.start().await?;
    kernel.run_until_complete(Duration::from_secs(10)).await?;
    kernel.stop().await?;

    assert_eq!(kernel.state().name(), "Completed");
    assert!(kernel.is_complete("speaker"));

    let epochs = epochs.lock().unwrap();
    assert_eq!(epochs.len(), 3);
    for epoch in epochs.iter() {
        assert_eq!(epoch.key, Some(key));
        assert_eq!(epoch.metadata["level"], 60.0);
        assert!(epoch.samples.iter().all(|v| (v - 0.5).abs() < 1e-12));
    }
    assert_eq!(epochs[1].start - epochs[0].start, 20);
    assert_eq!(epochs[2].start - epochs[1].start, 20);

    let names = names.lock().unwrap();
    let count = |name: &str| names.iter().filter(|n| n.as_str() == name).count();
    assert_eq!(count("speaker_queue_end"), 1);
    assert_eq!(count("speaker_complete"), 1);
    assert_eq!(count("kernel_stopped"), 1);
    assert_eq!(count("microphone_acquired"), 0);
    assert!(kernel.samples_acquired() >= epochs[2].start + 10);
    Ok(())
}

/// Loud on every other trial
struct Alternating {
    trial: usize,
}

impl WaveformFactory for Alternating {
    fn n_samples(&self, _fs: f64) -> usize {
        10
    }

    fn render(&mut self, _fs: f64) -> Result<Vec<f64>> {
        self.trial += 1;
        let amplitude = if self.trial % 2 == 0 { 2.0 } else { 0.2 };
        Ok(vec![amplitude; 10])
    }
}

#[tokio::test]
async fn test_rejected_trials_are_repeated() -> Result<()> {
    let mut kernel = AcquisitionKernel::new(engine(0.5), engine_config())?;
    let appender = kernel.add_output("speaker", QueuePolicy::Fifo, false)?;
    kernel.add_input("microphone", StageGraph::new())?;
    let config = ExtractorConfig {
        reject: Some(ArtifactReject {
            mode: RejectMode::Absolute,
            threshold: 0.5,
            detrend: false,
        }),
        ..epoch_config()
    };
    kernel.add_extractor(ExtractorBinding::new("mic", "microphone", "speaker").with_config(config))?;

    let key = appender.append(
        Source::factory(Alternating { trial: 0 }),
        3,
        Delays::Constant(0.01),
        Metadata::new(),
    )?;
    let epochs = collect_epochs(&mut kernel, "mic");

    kernel.invoke("speaker.start")?;
    kernel.start().await?;
    kernel.run_until_complete(Duration::from_secs(10)).await?;
    kernel.stop().await?;

    // Exactly the requested number of clean epochs, whatever played beyond it
    let epochs = epochs.lock().unwrap();
    assert_eq!(epochs.len(), 3);
    assert!(epochs.iter().all(|e| e.samples.iter().all(|v| (v - 0.1).abs() < 1e-12)));

    let counts = kernel.epoch_counts("mic").unwrap()[&key];
    assert!(counts.valid >= 3);
    assert!(counts.rejected >= 2);
    Ok(())
}

#[tokio::test]
async fn test_prepared_queue_waits_for_start() -> Result<()> {
    let mut kernel = AcquisitionKernel::new(engine(1.0), engine_config())?;
    kernel.add_output("speaker", QueuePolicy::Fifo, true)?;
    kernel.add_input("microphone", StageGraph::new())?;
    kernel.add_extractor(
        ExtractorBinding::new("mic", "microphone", "speaker").with_config(epoch_config()),
    )?;
    kernel.on_prepare_queue("speaker", |appender, channel| {
        assert_eq!(channel.fs, FS);
        appender.append(Source::samples(vec![0.25; 10]), 2, Delays::Constant(0.01), Metadata::new())?;
        Ok(())
    })?;
    assert!(kernel.invoke("speaker.unknown").is_err());
    kernel.invoke("speaker.prepare_queue")?;
    let epochs = collect_epochs(&mut kernel, "mic");

    kernel.start().await?;
    for _ in 0..10 {
        kernel.dispatch_timeout(Duration::from_millis(10));
    }
    assert!(epochs.lock().unwrap().is_empty());
    assert!(!kernel.is_complete("speaker"));

    kernel.invoke("speaker.start")?;
    kernel.run_until_complete(Duration::from_secs(10)).await?;
    kernel.stop().await?;
    assert_eq!(epochs.lock().unwrap().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_acquire_epochs_interleaved() -> Result<()> {
    let plan = EpochAcquisition {
        policy: QueuePolicy::InterleavedFifo,
        extractor: epoch_config(),
        ..EpochAcquisition::new("speaker", "microphone")
    };
    let epochs = acquire_epochs(engine(1.0), engine_config(), &plan, |appender, _| {
        for level in [1.0, 2.0] {
            let metadata = Metadata::from([("level".to_string(), level.into())]);
            appender.append(Source::samples(vec![level; 10]), 2, Delays::Constant(0.01), metadata)?;
        }
        Ok(())
    })
    .await?;

    let levels: Vec<f64> = epochs
        .iter()
        .map(|e| e.metadata["level"].as_f64().unwrap())
        .collect();
    assert_eq!(levels, vec![1.0, 2.0, 1.0, 2.0]);
    assert!(epochs.iter().all(|e| e.samples[0] == e.metadata["level"].as_f64().unwrap()));
    Ok(())
}

#[tokio::test]
async fn test_prestim_window_kept_for_first_trial() -> Result<()> {
    let plan = EpochAcquisition {
        extractor: ExtractorConfig {
            prestim: 0.002,
            ..epoch_config()
        },
        ..EpochAcquisition::new("speaker", "microphone")
    };
    let epochs = acquire_epochs(engine(1.0), engine_config(), &plan, |appender, _| {
        appender.append(Source::samples(vec![0.5; 10]), 3, Delays::Constant(0.01), Metadata::new())?;
        Ok(())
    })
    .await?;

    assert_eq!(epochs.len(), 3);
    for epoch in &epochs {
        assert_eq!(epoch.samples.len(), 12);
        assert!(epoch.samples[..2].iter().all(|v| *v == 0.0));
        assert!(epoch.samples[2..].iter().all(|v| *v == 0.5));
    }
    assert_eq!(epochs[1].start - epochs[0].start, 20);
    assert_eq!(epochs[2].start - epochs[1].start, 20);
    Ok(())
}

#[tokio::test]
async fn test_recording_and_acquired_events() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("microphone.bin");

    let mut kernel = AcquisitionKernel::new(engine(1.0), engine_config())?;
    kernel.add_input("microphone", StageGraph::new())?;
    kernel.record("microphone", &path)?;
    let blocks = Arc::new(Mutex::new(0usize));
    let counter = blocks.clone();
    kernel.subscribe("microphone_acquired", move |_| *counter.lock().unwrap() += 1);

    kernel.start().await?;
    for _ in 0..10 {
        kernel.dispatch_timeout(Duration::from_millis(10));
    }
    kernel.stop().await?;

    assert!(*blocks.lock().unwrap() > 0);
    let reader = ContinuousReader::open(&path)?;
    assert_eq!(reader.start(), 0);
    assert_eq!(reader.len() as u64, kernel.samples_acquired());
    Ok(())
}

#[tokio::test]
async fn test_setup_locked_while_running() -> Result<()> {
    let mut kernel = AcquisitionKernel::new(engine(1.0), engine_config())?;
    kernel.add_input("microphone", StageGraph::new())?;
    kernel.start().await?;
    assert!(kernel.add_output("speaker", QueuePolicy::Fifo, true).is_err());
    assert!(kernel.run_until_complete(Duration::from_millis(10)).await.is_err());
    kernel.stop().await?;
    assert_eq!(kernel.state().name(), "Completed");
    Ok(())
}
