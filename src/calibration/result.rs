use super::spectrum::db;
use super::tone::{tone_table, ToneAnalysis};
use super::types::{Calibration, CalibrationHandle};
use super::CalibrationError;
use crate::store::{Table, TableStore};
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Note attached to a calibration run for the user to review
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub frequency: Option<f64>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(frequency: f64, message: impl Into<String>) -> Self {
        Self {
            frequency: Some(frequency),
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self {
            frequency: None,
            message: message.into(),
        }
    }
}

/// Output ceiling used to exclude frequencies the hardware cannot reach.
///
/// A frequency is dropped when playing `target_spl` there would need more
/// than `max_gain` dB re 1 Vrms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyLimit {
    pub target_spl: f64,
    pub max_gain: f64,
}

impl SafetyLimit {
    pub fn allows(&self, sens: f64) -> bool {
        sens + self.target_spl <= self.max_gain
    }
}

/// Table, calibration and diagnostics from one calibration run.
///
/// `calibration` is `None` when nothing usable was measured; the table and
/// diagnostics are still kept so the run can be inspected and retried.
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    /// Artifact name (`tone_sens`, `golay_sens`, `chirp_sens`)
    pub name: String,
    pub table: Table,
    pub calibration: Option<Calibration>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CalibrationResult {
    pub fn is_empty(&self) -> bool {
        self.calibration.is_none()
    }

    /// Swap the result onto a channel; refuses an empty result
    pub fn install_on(&self, handle: &CalibrationHandle) -> Result<(), CalibrationError> {
        match &self.calibration {
            Some(calibration) => {
                handle.install(calibration.clone());
                Ok(())
            }
            None => Err(CalibrationError::NoValidFrequencies),
        }
    }

    pub fn save(&self, store: &TableStore) -> Result<PathBuf> {
        store.save(&self.name, &self.table)
    }
}

/// Persist per-channel results of one kind together under `name`
pub fn save_merged(
    store: &TableStore,
    name: &str,
    results: &BTreeMap<String, CalibrationResult>,
) -> Result<PathBuf> {
    let tables: BTreeMap<String, Table> = results
        .iter()
        .map(|(channel, result)| (channel.clone(), result.table.clone()))
        .collect();
    store.save_merged(name, &tables)
}

/// Keep finite rows at positive frequencies that pass the safety limit
fn usable_rows(
    frequency: &[f64],
    sens: &[f64],
    limit: Option<SafetyLimit>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<bool> {
    frequency
        .iter()
        .zip(sens.iter())
        .map(|(&f, &s)| {
            if !(f > 0.0) || !s.is_finite() {
                return false;
            }
            match limit {
                Some(limit) if !limit.allows(s) => {
                    diagnostics.push(Diagnostic::new(
                        f,
                        format!(
                            "{:.1} dB SPL needs {:.1} dB re 1 Vrms, above the {:.1} dB limit",
                            limit.target_spl,
                            s + limit.target_spl,
                            limit.max_gain
                        ),
                    ));
                    false
                }
                _ => true,
            }
        })
        .collect()
}

fn pick(values: &[f64], keep: &[bool]) -> Vec<f64> {
    values
        .iter()
        .zip(keep.iter())
        .filter(|(_, k)| **k)
        .map(|(v, _)| *v)
        .collect()
}

fn build(
    name: &str,
    table: Table,
    frequency: &[f64],
    sens: &[f64],
    phase: Option<&[f64]>,
    limit: Option<SafetyLimit>,
    mut diagnostics: Vec<Diagnostic>,
) -> CalibrationResult {
    let keep = usable_rows(frequency, sens, limit, &mut diagnostics);
    let table = table.filter_rows(&keep);

    let calibration = match Calibration::interp_with_phase(
        pick(frequency, &keep),
        pick(sens, &keep),
        phase.map(|p| pick(p, &keep)),
    ) {
        Ok(calibration) => Some(calibration),
        Err(e) => {
            tracing::warn!(name, error = %e, "calibration produced no usable points");
            diagnostics.push(Diagnostic::general(e.to_string()));
            None
        }
    };

    CalibrationResult {
        name: name.to_string(),
        table,
        calibration,
        diagnostics,
    }
}

/// Calibration from analysed tones.
///
/// Failing SNR/THD flags stay in the table as metadata; only non-finite rows
/// and rows above the safety limit are excluded.
pub fn tone_result(
    rows: &[ToneAnalysis],
    diagnostics: Vec<Diagnostic>,
    limit: Option<SafetyLimit>,
) -> Result<CalibrationResult> {
    let frequency: Vec<f64> = rows.iter().map(|r| r.frequency).collect();
    let sens: Vec<f64> = rows.iter().map(|r| r.sens).collect();
    Ok(build(
        "tone_sens",
        tone_table(rows)?,
        &frequency,
        &sens,
        None,
        limit,
        diagnostics,
    ))
}

/// Output sensitivity from a measured transfer function.
///
/// `amplitude` is response Vrms per stimulus Vrms, converted to SPL through
/// the input calibration: a 1 Vrms drive reaching `spl` gives
/// `sens = -spl - reference_offset`.
#[allow(clippy::too_many_arguments)]
pub fn transfer_result(
    name: &str,
    frequency: &[f64],
    amplitude: &[f64],
    phase: Option<&[f64]>,
    input_calibration: &Calibration,
    reference_offset: f64,
    limit: Option<SafetyLimit>,
) -> Result<CalibrationResult> {
    for column in std::iter::once(amplitude).chain(phase) {
        if column.len() != frequency.len() {
            return Err(CalibrationError::LengthMismatch {
                expected: frequency.len(),
                actual: column.len(),
            }
            .into());
        }
    }

    let spl = input_calibration.get_db_spectrum(frequency, amplitude);
    let sens: Vec<f64> = spl.iter().map(|s| db(1.0) - s - reference_offset).collect();

    let mut table = Table::new("frequency", frequency.to_vec());
    table.insert("amplitude", amplitude.to_vec())?;
    table.insert("spl", spl)?;
    table.insert("sens", sens.clone())?;
    if let Some(phase) = phase {
        table.insert("phase", phase.to_vec())?;
    }

    Ok(build(name, table, frequency, &sens, phase, limit, Vec::new()))
}
