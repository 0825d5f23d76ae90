use super::result::Diagnostic;
use super::spectrum::{db, rms, tone_power, Window};
use super::types::Calibration;
use crate::store::Table;
use anyhow::Result;
use std::f64::consts::{PI, SQRT_2};

/// Response recorded while a tone of known level played
#[derive(Debug, Clone)]
pub struct ToneMeasurement {
    pub frequency: f64,
    /// Vrms applied to the output
    pub output_vrms: f64,
    pub fs: f64,
    pub response: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct ToneSettings {
    /// Seconds trimmed off each end of the response before analysis
    pub trim: f64,
    /// Reject tones whose THD (percent) exceeds this
    pub max_thd: Option<f64>,
    /// Reject tones whose SNR (dB) falls below this
    pub min_snr: Option<f64>,
    /// Harmonics (including the fundamental) considered for THD
    pub harmonics: usize,
    /// Fixed hardware gain between the digital output and the transducer, dB
    pub reference_offset: f64,
}

impl Default for ToneSettings {
    fn default() -> Self {
        Self {
            trim: 10e-3,
            max_thd: None,
            min_snr: None,
            harmonics: 3,
            reference_offset: 0.0,
        }
    }
}

/// Per-tone analysis, one table row per measurement
#[derive(Debug, Clone, PartialEq)]
pub struct ToneAnalysis {
    pub frequency: f64,
    pub output_vrms: f64,
    /// Measured Vrms at the tone frequency
    pub rms: f64,
    pub spl: f64,
    pub sens: f64,
    pub snr: f64,
    pub thd: f64,
    pub pass: bool,
}

/// Fundamental, THD (percent) and SNR (dB) of a trimmed response
pub fn analyze_tone(response: &[f64], fs: f64, frequency: f64, harmonics: usize) -> (f64, f64, f64) {
    let fundamental = tone_power(response, fs, frequency, Window::Flattop);

    let nyquist = fs / 2.0;
    let harmonic_power: f64 = (2..=harmonics.max(1))
        .map(|h| h as f64 * frequency)
        .filter(|f| *f < nyquist)
        .map(|f| tone_power(response, fs, f, Window::Flattop).powi(2))
        .sum();
    let thd = harmonic_power.sqrt() / fundamental * 100.0;

    // Whatever the fitted fundamental does not explain counts as noise
    let omega = 2.0 * PI * frequency / fs;
    let (mut re, mut im) = (0.0, 0.0);
    for (i, v) in response.iter().enumerate() {
        re += v * (omega * i as f64).cos();
        im += v * (omega * i as f64).sin();
    }
    let n = response.len().max(1) as f64;
    let (re, im) = (2.0 * re / n, 2.0 * im / n);
    let residual: Vec<f64> = response
        .iter()
        .enumerate()
        .map(|(i, v)| v - re * (omega * i as f64).cos() - im * (omega * i as f64).sin())
        .collect();
    let noise = rms(&residual);
    let snr = db(fundamental) - db(noise);

    (fundamental, thd, snr)
}

/// Output sensitivity from tones played at a known level and recorded
/// through a calibrated input.
///
/// `sens = output level (dB re 1 Vrms) - measured SPL - reference offset`.
/// Tones failing the SNR/THD limits are kept in the table with `pass = 0`
/// and reported as diagnostics; they never abort the analysis.
pub fn tone_sens(
    measurements: &[ToneMeasurement],
    input_calibration: &Calibration,
    settings: &ToneSettings,
) -> (Vec<ToneAnalysis>, Vec<Diagnostic>) {
    let mut rows = Vec::with_capacity(measurements.len());
    let mut diagnostics = Vec::new();

    for m in measurements {
        let trim = (settings.trim * m.fs).round() as usize;
        let response = if m.response.len() > 2 * trim {
            &m.response[trim..m.response.len() - trim]
        } else {
            diagnostics.push(Diagnostic::new(
                m.frequency,
                format!("response of {} samples too short to trim", m.response.len()),
            ));
            &m.response[..]
        };

        let (vrms, thd, snr) = analyze_tone(response, m.fs, m.frequency, settings.harmonics);
        let spl = input_calibration.get_db(m.frequency, vrms);
        let sens = db(m.output_vrms) - spl - settings.reference_offset;

        let mut pass = vrms.is_finite() && spl.is_finite();
        if let Some(max_thd) = settings.max_thd {
            if !(thd <= max_thd) {
                pass = false;
                diagnostics.push(Diagnostic::new(
                    m.frequency,
                    format!("THD {:.2}% exceeds {:.2}%", thd, max_thd),
                ));
            }
        }
        if let Some(min_snr) = settings.min_snr {
            if !(snr >= min_snr) {
                pass = false;
                diagnostics.push(Diagnostic::new(
                    m.frequency,
                    format!("SNR {:.1} dB below {:.1} dB", snr, min_snr),
                ));
            }
        }

        rows.push(ToneAnalysis {
            frequency: m.frequency,
            output_vrms: m.output_vrms,
            rms: vrms,
            spl,
            sens,
            snr,
            thd,
            pass,
        });
    }

    rows.sort_by(|a, b| a.frequency.total_cmp(&b.frequency));
    (rows, diagnostics)
}

/// `tone_sens` table layout
pub fn tone_table(rows: &[ToneAnalysis]) -> Result<Table> {
    let col = |f: fn(&ToneAnalysis) -> f64| rows.iter().map(f).collect::<Vec<f64>>();
    let mut table = Table::new("frequency", col(|r| r.frequency));
    table.insert("output_vrms", col(|r| r.output_vrms))?;
    table.insert("rms", col(|r| r.rms))?;
    table.insert("spl", col(|r| r.spl))?;
    table.insert("sens", col(|r| r.sens))?;
    table.insert("snr", col(|r| r.snr))?;
    table.insert("thd", col(|r| r.thd))?;
    table.insert("pass", col(|r| if r.pass { 1.0 } else { 0.0 }))?;
    Ok(table)
}

/// Tone of `vrms` at `frequency`, for synthesising measurements
pub fn sine(fs: f64, frequency: f64, vrms: f64, n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| vrms * SQRT_2 * (2.0 * PI * frequency * i as f64 / fs).sin())
        .collect()
}
