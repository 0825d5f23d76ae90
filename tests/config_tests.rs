use anyhow::Result;
use evokedlab::hal::SimulatedEngine;
use evokedlab::queue::{Delays, Source};
use evokedlab::{ExperimentConfig, KernelEvent};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CONFIG: &str = r#"{
    "engine": {
        "monitor_period": 0.01,
        "buffer_size": 0.02,
        "channels": [
            {"name": "speaker", "direction": "output", "fs": 2000.0},
            {"name": "eeg", "direction": "input", "fs": 2000.0}
        ]
    },
    "simulation": {"gain": 0.5},
    "inputs": [{
        "name": "eeg",
        "graph": {
            "nodes": [
                {"id": "amp", "type": "Gain", "config": {"gain": 4.0}},
                {"id": "ds", "type": "Downsample", "config": {"q": 2}}
            ],
            "connections": [{"from": "amp", "to": "ds"}]
        }
    }],
    "outputs": [{"name": "speaker"}],
    "extractors": [{"name": "abr", "input": "eeg", "output": "speaker",
                    "source": "ds", "fs": 1000.0,
                    "config": {"epoch_size": 0.005}}]
}"#;

#[tokio::test]
async fn test_config_file_drives_acquisition() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("abr.json");
    std::fs::write(&path, CONFIG)?;

    let config = ExperimentConfig::load(&path)?;
    let engine = Box::new(SimulatedEngine::new(config.simulation.clone()));
    let mut kernel = config.build_kernel(engine)?;

    kernel
        .appender("speaker")?
        .append(Source::samples(vec![1.0; 20]), 2, Delays::Constant(0.01), Default::default())?;

    let epochs = Arc::new(Mutex::new(Vec::new()));
    let sink = epochs.clone();
    kernel.subscribe("abr_epochs", move |event| {
        if let KernelEvent::Epochs { epochs, .. } = event {
            sink.lock().unwrap().extend(epochs.iter().cloned());
        }
    });

    kernel.invoke("speaker.start")?;
    kernel.start().await?;
    kernel.run_until_complete(Duration::from_secs(10)).await?;
    kernel.stop().await?;

    let epochs = epochs.lock().unwrap();
    assert_eq!(epochs.len(), 2);
    for epoch in epochs.iter() {
        assert_eq!(epoch.fs, 1000.0);
        assert_eq!(epoch.samples.len(), 5);
        assert!(epoch.samples.iter().all(|v| (v - 2.0).abs() < 1e-12));
    }

    let metrics = kernel.metrics();
    assert!(metrics.get_stage_metrics("eeg.amp").unwrap().blocks_in() > 0);
    Ok(())
}

#[test]
fn test_extractor_must_reference_configured_lines() {
    let broken = CONFIG.replace(r#""input": "eeg", "output""#, r#""input": "emg", "output""#);
    assert!(ExperimentConfig::from_json_str(&broken).is_err());

    let wrong_direction = CONFIG.replace(r#""outputs": [{"name": "speaker"}]"#, r#""outputs": [{"name": "eeg"}]"#);
    assert!(ExperimentConfig::from_json_str(&wrong_direction).is_err());
}
