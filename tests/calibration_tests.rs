use evokedlab::calibration::result::tone_result;
use evokedlab::calibration::spectrum::{correlation, db};
use evokedlab::calibration::tone::sine;
use evokedlab::calibration::{
    chirp_tf, golay_pair, golay_tf, log_chirp, tone_sens, Calibration, CalibrationError,
    CalibrationHandle, ChirpSettings, ToneMeasurement, ToneSettings,
};

type Constructor = fn(Vec<f64>, Vec<f64>) -> Result<Calibration, CalibrationError>;

/// Deliberately unsorted, the constructors order by frequency
fn two_point(constructor: Constructor) -> Calibration {
    constructor(vec![2000.0, 1000.0], vec![-42.0, -40.0]).unwrap()
}

#[test]
fn test_interp_lies_between_measured_points() {
    let cal = two_point(Calibration::interp);
    assert_eq!(cal.get_sens(1000.0), -40.0);
    assert_eq!(cal.get_sens(2000.0), -42.0);

    let sf = |f| cal.get_sf(f, 80.0);
    assert!(sf(1500.0) < sf(1000.0));
    assert!(sf(1500.0) > sf(2000.0));

    assert!(cal.get_sens(999.0).is_nan());
    assert!(cal.get_sf(2001.0, 80.0).is_nan());
    assert_eq!(cal.frequency_range(), Some((1000.0, 2000.0)));
}

#[test]
fn test_point_only_answers_measured_frequencies() {
    let cal = two_point(Calibration::point);
    assert_eq!(cal.get_sens(1000.0), -40.0);
    assert!(cal.get_sens(1500.0).is_nan());
    assert!(cal.get_spl(1500.0, 1.0).is_nan());
}

#[test]
fn test_spl_and_gain_are_inverse() {
    let cal = Calibration::flat(-94.0).with_fixed_gain(6.0);
    let gain = cal.get_gain(1000.0, 70.0);
    assert!((gain - (70.0 - 100.0)).abs() < 1e-12);
    let vrms = cal.get_sf(1000.0, 70.0);
    assert!((cal.get_spl(1000.0, vrms) - 70.0).abs() < 1e-9);
}

#[test]
fn test_handle_swap_visible_to_clones() {
    let handle = CalibrationHandle::new(Calibration::unity());
    let reader = handle.clone();
    assert_eq!(reader.get_spl(1000.0, 1.0), 0.0);
    handle.install(Calibration::flat(-20.0));
    assert!((reader.get_spl(1000.0, 1.0) - 20.0).abs() < 1e-12);
}

#[test]
fn test_golay_recovers_impulse_response() {
    let (a, b) = golay_pair(10);
    let n = a.len();
    let h = [0.0, 0.8, -0.3, 0.15, 0.05, -0.02];

    // Steady-state response to back-to-back repetitions is circular
    let respond = |x: &[f64]| -> Vec<f64> {
        (0..n)
            .map(|i| {
                h.iter()
                    .enumerate()
                    .map(|(k, hk)| hk * x[(i + n - k) % n])
                    .sum()
            })
            .collect()
    };
    let transfer = golay_tf(&a, &b, &respond(&a), &respond(&b), 20000.0).unwrap();

    let mut expected = h.to_vec();
    expected.resize(64, 0.0);
    assert!(correlation(&transfer.impulse[..64], &expected) > 0.999);
    assert!((transfer.impulse[1] - 0.8).abs() < 1e-9);
    assert_eq!(transfer.frequency.len(), transfer.amplitude.len());
}

#[test]
fn test_chirp_flat_gain() {
    let fs = 20000.0;
    let settings = ChirpSettings {
        start_frequency: 200.0,
        end_frequency: 8000.0,
        duration: 0.05,
        amplitude: 0.5,
        ramp: 0.0,
    };
    let stimulus = log_chirp(fs, &settings);
    let mut response: Vec<f64> = stimulus.iter().map(|v| v * 0.25).collect();
    response.resize(stimulus.len() + 100, 0.0);

    let transfer = chirp_tf(fs, &stimulus, &[response.clone(), response], (200.0, 8000.0)).unwrap();
    assert!(transfer.frequency.iter().all(|f| (200.0..=8000.0).contains(f)));
    assert!(transfer.amplitude.iter().all(|a| (a - 0.25).abs() < 1e-6));
}

#[test]
fn test_tone_sens_through_reference_microphone() {
    let fs = 48000.0;
    let mic = Calibration::flat(-50.0);
    let measurements: Vec<ToneMeasurement> = [1000.0, 4000.0]
        .iter()
        .map(|&frequency| ToneMeasurement {
            frequency,
            output_vrms: 1.0,
            fs,
            // The speaker turns 1 Vrms into 0.1 Vrms at the microphone
            response: sine(fs, frequency, 0.1, 4800),
        })
        .collect();

    let (rows, diagnostics) = tone_sens(&measurements, &mic, &ToneSettings::default());
    assert!(diagnostics.is_empty());
    // 0.1 Vrms reads as 30 dB SPL, so 0 dB re 1 Vrms gives 30 dB SPL
    for row in &rows {
        assert!((row.spl - 30.0).abs() < 0.05, "{} Hz", row.frequency);
        assert!((row.sens + 30.0).abs() < 0.05);
    }

    let result = tone_result(&rows, diagnostics, None).unwrap();
    let cal = result.calibration.unwrap();
    assert_eq!(cal.name(), "interp");
    assert!((cal.get_gain(2000.0, 90.0) - 60.0).abs() < 0.1);
    assert!(db(cal.get_sf(1000.0, 30.0)).abs() < 0.1);
}
