//! Measure-and-analyse cycles: play a calibration stimulus on an output,
//! record it on an input and turn the epochs into a [`CalibrationResult`].

use super::chirp::{log_chirp, ChirpSettings};
use super::golay::summarize_golay;
use super::result::{tone_result, transfer_result, CalibrationResult, SafetyLimit};
use super::spectrum::dbi;
use super::tone::{sine, tone_sens, ToneMeasurement, ToneSettings};
use super::types::Calibration;
use super::{chirp_tf, CalibrationError};
use crate::core::{Epoch, Metadata};
use crate::engine::{acquire_epochs, EpochAcquisition};
use crate::extract::ExtractorConfig;
use crate::hal::{Engine, EngineConfig};
use crate::queue::{ChirpFactory, Delays, GolayFactory, GolayLeg, QueuePolicy, Source};
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// A calibration run against live (or simulated) hardware
#[async_trait]
pub trait CalibrationProcedure: Send + Sync {
    /// Artifact name the result is stored under
    fn name(&self) -> &str;

    async fn run(&self, engine: Box<dyn Engine>, config: EngineConfig) -> Result<CalibrationResult>;
}

/// Output and input a procedure plays through and records from
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub output: String,
    pub input: String,
    /// Output level in dB re 1 V
    pub gain: f64,
    pub limit: Option<SafetyLimit>,
    pub timeout: Duration,
}

impl Route {
    pub fn new(output: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            input: input.into(),
            gain: -40.0,
            limit: None,
            timeout: Duration::from_secs(60),
        }
    }

    fn plan(&self, policy: QueuePolicy, extractor: ExtractorConfig) -> EpochAcquisition {
        EpochAcquisition {
            policy,
            extractor,
            timeout: self.timeout,
            ..EpochAcquisition::new(&self.output, &self.input)
        }
    }
}

fn input_calibration(config: &EngineConfig, input: &str) -> Result<Calibration> {
    Ok(config.channel(input)?.calibration.clone().unwrap_or_default())
}

fn output_fs(config: &EngineConfig, output: &str) -> Result<f64> {
    Ok(config.channel(output)?.fs)
}

fn tagged(key: &str, value: impl Into<Value>) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(key.to_string(), value.into());
    metadata
}

/// One tone per frequency, sensitivity from the level at the tone frequency
#[derive(Debug, Clone)]
pub struct ToneProcedure {
    pub route: Route,
    pub frequencies: Vec<f64>,
    /// Tone duration, seconds
    pub duration: f64,
    /// Silence between tones, seconds
    pub iti: f64,
    pub settings: ToneSettings,
}

impl ToneProcedure {
    pub fn new(route: Route, frequencies: Vec<f64>) -> Self {
        Self {
            route,
            frequencies,
            duration: 100e-3,
            iti: 0.0,
            settings: ToneSettings::default(),
        }
    }
}

#[async_trait]
impl CalibrationProcedure for ToneProcedure {
    fn name(&self) -> &str {
        "tone_sens"
    }

    async fn run(&self, engine: Box<dyn Engine>, config: EngineConfig) -> Result<CalibrationResult> {
        let fs = output_fs(&config, &self.route.output)?;
        for &f in &self.frequencies {
            if !(f > 0.0 && f < fs / 2.0) {
                bail!("Calibration tone at {} Hz is outside 0-{} Hz", f, fs / 2.0);
            }
        }
        let input_cal = input_calibration(&config, &self.route.input)?;
        let vrms = dbi(self.route.gain);
        let n = (self.duration * fs).round() as usize;

        tracing::info!(
            output = %self.route.output,
            tones = self.frequencies.len(),
            gain = self.route.gain,
            "running tone calibration"
        );
        let plan = self.route.plan(QueuePolicy::Fifo, ExtractorConfig::default());
        let epochs = acquire_epochs(engine, config, &plan, |appender, _| {
            for &f in &self.frequencies {
                appender.append(
                    Source::samples(sine(fs, f, vrms, n)),
                    1,
                    Delays::Constant(self.iti),
                    tagged("frequency", f),
                )?;
            }
            Ok(())
        })
        .await?;

        let measurements: Vec<ToneMeasurement> = epochs
            .into_iter()
            .filter_map(|epoch| {
                let frequency = epoch.metadata.get("frequency")?.as_f64()?;
                Some(ToneMeasurement {
                    frequency,
                    output_vrms: vrms,
                    fs: epoch.fs,
                    response: epoch.samples,
                })
            })
            .collect();
        let (rows, diagnostics) = tone_sens(&measurements, &input_cal, &self.settings);
        tone_result(&rows, diagnostics, self.route.limit)
    }
}

/// Golay pair calibration.
///
/// Every repetition of A plays before every repetition of B (FIFO queue, no
/// gap between repetitions) rather than interleaving the two. Deconvolution
/// is circular over one sequence length, so each averaged response must be
/// preceded by another copy of the same sequence; after an A/B switch the
/// window would hold the tail of the other sequence. The leading `discard`
/// repetitions of each sequence settle the system and are dropped before
/// averaging.
#[derive(Debug, Clone)]
pub struct GolayProcedure {
    pub route: Route,
    /// Sequence length is `2^order`
    pub order: u32,
    pub repetitions: usize,
    pub discard: usize,
    pub reference_offset: f64,
    /// Only frequencies inside this band enter the calibration
    pub band: Option<(f64, f64)>,
}

impl GolayProcedure {
    pub fn new(route: Route) -> Self {
        Self {
            route,
            order: 13,
            repetitions: 20,
            discard: 2,
            reference_offset: 0.0,
            band: None,
        }
    }
}

fn legs(epochs: Vec<Epoch>) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
    let mut a = Vec::new();
    let mut b = Vec::new();
    for epoch in epochs {
        match epoch.metadata.get("leg").and_then(|v| v.as_str()) {
            Some("A") => a.push(epoch.samples),
            Some("B") => b.push(epoch.samples),
            _ => tracing::debug!(start = epoch.start, "epoch without a Golay leg"),
        }
    }
    (a, b)
}

fn in_band(band: Option<(f64, f64)>, frequency: &[f64]) -> Vec<bool> {
    frequency
        .iter()
        .map(|f| band.map(|(lo, hi)| *f >= lo && *f <= hi).unwrap_or(true))
        .collect()
}

fn select(values: &[f64], keep: &[bool]) -> Vec<f64> {
    values
        .iter()
        .zip(keep)
        .filter(|(_, k)| **k)
        .map(|(v, _)| *v)
        .collect()
}

#[async_trait]
impl CalibrationProcedure for GolayProcedure {
    fn name(&self) -> &str {
        "golay_sens"
    }

    async fn run(&self, engine: Box<dyn Engine>, config: EngineConfig) -> Result<CalibrationResult> {
        if self.repetitions <= self.discard {
            return Err(CalibrationError::InsufficientRepetitions {
                available: self.repetitions,
                discard: self.discard,
            }
            .into());
        }
        let fs = output_fs(&config, &self.route.output)?;
        let input_cal = input_calibration(&config, &self.route.input)?;
        let amplitude = dbi(self.route.gain);
        let a = GolayFactory::new(self.order, GolayLeg::A, amplitude);
        let b = GolayFactory::new(self.order, GolayLeg::B, amplitude);
        let (a_played, b_played) = (a.sequence().to_vec(), b.sequence().to_vec());

        tracing::info!(
            output = %self.route.output,
            order = self.order,
            repetitions = self.repetitions,
            "running Golay calibration"
        );
        let plan = self.route.plan(QueuePolicy::Fifo, ExtractorConfig::default());
        let repetitions = self.repetitions;
        let epochs = acquire_epochs(engine, config, &plan, move |appender, _| {
            appender.append(Source::factory(a), repetitions, Delays::default(), tagged("leg", "A"))?;
            appender.append(Source::factory(b), repetitions, Delays::default(), tagged("leg", "B"))?;
            Ok(())
        })
        .await?;

        let (a_epochs, b_epochs) = legs(epochs);
        let transfer = summarize_golay(fs, &a_played, &b_played, &a_epochs, &b_epochs, self.discard)?;
        let keep = in_band(self.band, &transfer.frequency);
        transfer_result(
            self.name(),
            &select(&transfer.frequency, &keep),
            &select(&transfer.amplitude, &keep),
            Some(&select(&transfer.phase, &keep)),
            &input_cal,
            self.reference_offset,
            self.route.limit,
        )
    }
}

/// Logarithmic sweep, averaged over repetitions
#[derive(Debug, Clone)]
pub struct ChirpProcedure {
    pub route: Route,
    /// `amplitude` is replaced by the route gain
    pub settings: ChirpSettings,
    /// Silence after each sweep, recorded as part of the response
    pub iti: f64,
    pub repetitions: usize,
    pub reference_offset: f64,
}

impl ChirpProcedure {
    pub fn new(route: Route) -> Self {
        Self {
            route,
            settings: ChirpSettings::default(),
            iti: 1e-3,
            repetitions: 64,
            reference_offset: 0.0,
        }
    }
}

#[async_trait]
impl CalibrationProcedure for ChirpProcedure {
    fn name(&self) -> &str {
        "chirp_sens"
    }

    async fn run(&self, engine: Box<dyn Engine>, config: EngineConfig) -> Result<CalibrationResult> {
        if self.repetitions == 0 {
            return Err(CalibrationError::EmptyInput.into());
        }
        let fs = output_fs(&config, &self.route.output)?;
        let input_cal = input_calibration(&config, &self.route.input)?;
        let settings = ChirpSettings {
            amplitude: dbi(self.route.gain),
            ..self.settings
        };
        let stimulus = log_chirp(fs, &settings);

        tracing::info!(
            output = %self.route.output,
            band = ?(settings.start_frequency, settings.end_frequency),
            repetitions = self.repetitions,
            "running chirp calibration"
        );
        let extractor = ExtractorConfig {
            epoch_size: Some(settings.duration + self.iti),
            ..Default::default()
        };
        let plan = self.route.plan(QueuePolicy::Fifo, extractor);
        let (repetitions, iti) = (self.repetitions, self.iti);
        let epochs = acquire_epochs(engine, config, &plan, move |appender, _| {
            appender.append(
                Source::factory(ChirpFactory { settings }),
                repetitions,
                Delays::Constant(iti),
                Metadata::new(),
            )?;
            Ok(())
        })
        .await?;

        let responses: Vec<Vec<f64>> = epochs.into_iter().map(|e| e.samples).collect();
        let transfer = chirp_tf(
            fs,
            &stimulus,
            &responses,
            (settings.start_frequency, settings.end_frequency),
        )?;
        transfer_result(
            self.name(),
            &transfer.frequency,
            &transfer.amplitude,
            Some(&transfer.phase),
            &input_cal,
            self.reference_offset,
            self.route.limit,
        )
    }
}
