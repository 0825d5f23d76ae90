use anyhow::{Context, Result};
use evokedlab::calibration::procedure::{
    CalibrationProcedure, ChirpProcedure, GolayProcedure, Route, ToneProcedure,
};
use evokedlab::calibration::{save_merged, Calibration, CalibrationResult, ChirpSettings};
use evokedlab::hal::{ChannelConfig, EngineConfig, LoopbackSettings, SimulatedEngine};
use evokedlab::store::TableStore;
use std::collections::BTreeMap;
use tracing_subscriber::EnvFilter;

const FS: f64 = 50000.0;

/// Reference microphone, 2.5 mV/Pa
const MIC_MV_PA: f64 = 2.5;

fn engine_config() -> EngineConfig {
    let mut microphone = ChannelConfig::input("microphone", FS);
    microphone.calibration = Some(Calibration::from_mv_pa(MIC_MV_PA));
    EngineConfig {
        monitor_period: 0.02,
        buffer_size: 0.05,
        channels: vec![ChannelConfig::output("speaker", FS), microphone],
    }
}

/// Speaker with a small resonance, heard through the reference microphone
fn loopback() -> LoopbackSettings {
    LoopbackSettings {
        gain: 0.2,
        impulse_response: vec![0.0, 0.6, 0.3, -0.1, 0.05],
        noise_rms: 1e-5,
        seed: 42,
        realtime: false,
    }
}

fn report(result: &CalibrationResult) {
    match &result.calibration {
        Some(calibration) => {
            for frequency in [1000.0, 4000.0, 8000.0] {
                tracing::info!(
                    result = %result.name,
                    frequency,
                    sens = calibration.get_sens(frequency),
                    "sensitivity"
                );
            }
        }
        None => tracing::warn!(result = %result.name, "no usable frequencies"),
    }
    for diagnostic in &result.diagnostics {
        tracing::warn!(result = %result.name, frequency = ?diagnostic.frequency, "{}", diagnostic.message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let root = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "calibration".to_string());
    let store = TableStore::new(&root).context("Failed to open calibration store")?;

    let route = || {
        let mut route = Route::new("speaker", "microphone");
        route.gain = -20.0;
        route
    };
    let procedures: Vec<Box<dyn CalibrationProcedure>> = vec![
        Box::new(ToneProcedure::new(route(), vec![500.0, 1000.0, 2000.0, 4000.0, 8000.0])),
        Box::new(GolayProcedure::new(route())),
        Box::new(ChirpProcedure {
            settings: ChirpSettings {
                start_frequency: 500.0,
                end_frequency: 20000.0,
                ..Default::default()
            },
            repetitions: 16,
            ..ChirpProcedure::new(route())
        }),
    ];

    for procedure in &procedures {
        let engine = Box::new(SimulatedEngine::new(loopback()));
        let result = procedure
            .run(engine, engine_config())
            .await
            .with_context(|| format!("{} calibration failed", procedure.name()))?;
        report(&result);

        let path = result.save(&store)?;
        let merged = BTreeMap::from([("speaker".to_string(), result)]);
        let merged_path = save_merged(&store, &format!("{}_merged", procedure.name()), &merged)?;
        println!("{}: {} and {}", procedure.name(), path.display(), merged_path.display());
    }
    Ok(())
}
