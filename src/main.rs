use anyhow::Result;
use evokedlab::core::Metadata;
use evokedlab::hal::SimulatedEngine;
use evokedlab::queue::{Delays, Source, ToneFactory};
use evokedlab::{ExperimentConfig, KernelEvent};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Tone-pip ABR run against the simulated engine
const DEMO_CONFIG: &str = r#"{
    "engine": {
        "monitor_period": 0.05,
        "buffer_size": 0.1,
        "channels": [
            {"name": "speaker", "direction": "output", "fs": 20000.0,
             "calibration": {"type": "flat", "sensitivity": -100.0, "fixed_gain": 0.0}},
            {"name": "eeg", "direction": "input", "fs": 20000.0}
        ]
    },
    "simulation": {"gain": 0.001, "impulse_response": [0.0, 0.0, 1.0], "noise_rms": 0.0001, "seed": 7},
    "inputs": [{
        "name": "eeg",
        "graph": {
            "nodes": [{"id": "hp", "type": "IIR Filter", "config": {"btype": "highpass", "fl": 100.0}}],
            "connections": []
        }
    }],
    "outputs": [{"name": "speaker", "policy": {"type": "interleaved_fifo"}}],
    "extractors": [{"name": "abr", "input": "eeg", "output": "speaker",
                    "config": {"prestim": 0.001, "epoch_size": 0.01}}]
}"#;

const FREQUENCIES: [f64; 3] = [1000.0, 2000.0, 4000.0];
const LEVELS: [f64; 2] = [60.0, 80.0];
const TRIALS: usize = 40;

#[derive(Default)]
struct Average {
    sum: Vec<f64>,
    n: usize,
}

impl Average {
    fn add(&mut self, samples: &[f64]) {
        if self.sum.len() < samples.len() {
            self.sum.resize(samples.len(), 0.0);
        }
        for (s, x) in self.sum.iter_mut().zip(samples) {
            *s += x;
        }
        self.n += 1;
    }

    fn peak_to_peak(&self) -> f64 {
        let n = self.n.max(1) as f64;
        let (lo, hi) = self
            .sum
            .iter()
            .map(|s| s / n)
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), x| {
                (lo.min(x), hi.max(x))
            });
        hi - lo
    }
}

fn condition(metadata: &Metadata) -> Option<(i64, i64)> {
    let frequency = metadata.get("frequency")?.as_f64()?;
    let level = metadata.get("level")?.as_f64()?;
    Some((frequency as i64, level as i64))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig::from_json_str(DEMO_CONFIG)?,
    };

    println!("evokedlab - simulated ABR acquisition");
    println!("======================================\n");

    let engine = Box::new(SimulatedEngine::new(config.simulation.clone()));
    let mut kernel = config.build_kernel(engine)?;

    let output = &config.outputs[0].name;
    let calibration = kernel.channel(output)?.calibration.clone();
    let appender = kernel.appender(output)?;
    for frequency in FREQUENCIES {
        for level in LEVELS {
            let tone = ToneFactory::new(frequency, level, 0.005, 0.0005, calibration.clone());
            let metadata = Metadata::from([
                ("frequency".to_string(), frequency.into()),
                ("level".to_string(), level.into()),
            ]);
            appender.append(Source::factory(tone), TRIALS, Delays::Constant(0.02), metadata)?;
        }
    }

    let averages = Arc::new(Mutex::new(BTreeMap::<(i64, i64), Average>::new()));
    let sink = averages.clone();
    kernel.subscribe("abr_epochs", move |event| {
        if let KernelEvent::Epochs { epochs, .. } = event {
            let mut averages = sink.lock().unwrap_or_else(|p| p.into_inner());
            for epoch in epochs {
                if let Some(key) = condition(&epoch.metadata) {
                    averages.entry(key).or_default().add(&epoch.samples);
                }
            }
        }
    });
    kernel.subscribe(format!("{}_complete", output), |event| {
        tracing::info!(event = %event.name(), "acquisition finished");
    });

    kernel.invoke(&format!("{}.start", output))?;
    kernel.start().await?;
    let waited = kernel.run_until_complete(Duration::from_secs(120)).await;
    kernel.stop().await?;
    waited?;

    println!("{:>10} {:>8} {:>8} {:>14}", "freq (Hz)", "dB SPL", "epochs", "p-p (uV)");
    for ((frequency, level), average) in averages.lock().unwrap_or_else(|p| p.into_inner()).iter() {
        println!(
            "{:>10} {:>8} {:>8} {:>14.3}",
            frequency,
            level,
            average.n,
            average.peak_to_peak() * 1e6
        );
    }

    println!("\n{}", kernel.metrics().report());
    println!("Samples acquired: {}", kernel.samples_acquired());
    Ok(())
}
