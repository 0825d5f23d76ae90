//! Spectral helpers shared by the calibration algorithms.
//!
//! Amplitude spectra are expressed in RMS units: a sinusoid of peak
//! amplitude `A` centred on a bin reads `A / sqrt(2)` in that bin.

use rustfft::{num_complex::Complex, FftPlanner};
use std::f64::consts::{PI, SQRT_2};

/// Amplitude to dB re 1
pub fn db(x: f64) -> f64 {
    20.0 * x.log10()
}

/// dB re 1 to amplitude
pub fn dbi(x: f64) -> f64 {
    10f64.powf(x / 20.0)
}

pub fn rms(x: &[f64]) -> f64 {
    if x.is_empty() {
        return f64::NAN;
    }
    (x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64).sqrt()
}

pub fn mean(x: &[f64]) -> f64 {
    if x.is_empty() {
        return f64::NAN;
    }
    x.iter().sum::<f64>() / x.len() as f64
}

/// Element-wise mean of equally long rows
pub fn average_rows(rows: &[Vec<f64>], len: usize) -> Vec<f64> {
    let mut acc = vec![0.0; len];
    for row in rows {
        for (a, v) in acc.iter_mut().zip(row.iter()) {
            *a += v;
        }
    }
    let n = rows.len().max(1) as f64;
    acc.iter_mut().for_each(|a| *a /= n);
    acc
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Rect,
    Hann,
    Flattop,
}

impl Window {
    pub fn coefficients(&self, n: usize) -> Vec<f64> {
        if n < 2 {
            return vec![1.0; n];
        }
        let m = (n - 1) as f64;
        (0..n)
            .map(|i| {
                let x = 2.0 * PI * i as f64 / m;
                match self {
                    Window::Rect => 1.0,
                    Window::Hann => 0.5 * (1.0 - x.cos()),
                    Window::Flattop => {
                        0.21557895 - 0.41663158 * x.cos() + 0.277263158 * (2.0 * x).cos()
                            - 0.083578947 * (3.0 * x).cos()
                            + 0.006947368 * (4.0 * x).cos()
                    }
                }
            })
            .collect()
    }
}

/// Real-input FFT, returning the `n / 2 + 1` non-negative frequency bins
pub fn rfft(x: &[f64]) -> Vec<Complex<f64>> {
    let n = x.len();
    if n == 0 {
        return Vec::new();
    }
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    let mut buffer: Vec<Complex<f64>> = x.iter().map(|&v| Complex::new(v, 0.0)).collect();
    fft.process(&mut buffer);
    buffer.truncate(n / 2 + 1);
    buffer
}

/// Inverse of [`rfft`] for a time signal of length `n`
pub fn irfft(spectrum: &[Complex<f64>], n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    let mut buffer = vec![Complex::new(0.0, 0.0); n];
    for (k, value) in spectrum.iter().enumerate().take(n / 2 + 1) {
        buffer[k] = *value;
        if k > 0 && k < n - k {
            buffer[n - k] = value.conj();
        }
    }
    let mut planner = FftPlanner::new();
    let ifft = planner.plan_fft_inverse(n);
    ifft.process(&mut buffer);
    buffer.iter().map(|c| c.re / n as f64).collect()
}

/// Bin centre frequencies for an `n` point [`rfft`]
pub fn rfftfreq(n: usize, fs: f64) -> Vec<f64> {
    (0..n / 2 + 1).map(|k| k as f64 * fs / n as f64).collect()
}

/// Windowed amplitude spectrum in Vrms per bin
pub fn psd(x: &[f64], window: Window) -> Vec<f64> {
    let n = x.len();
    let w = window.coefficients(n);
    let w_sum: f64 = w.iter().sum();
    let windowed: Vec<f64> = x.iter().zip(w.iter()).map(|(v, w)| v * w).collect();
    rfft(&windowed)
        .iter()
        .enumerate()
        .map(|(k, c)| {
            let edge = k == 0 || (n % 2 == 0 && k == n / 2);
            if edge {
                c.norm() / w_sum
            } else {
                c.norm() * SQRT_2 / w_sum
            }
        })
        .collect()
}

/// Vrms of the component at `frequency`, correlating against a complex
/// exponential so the tone need not sit on a bin centre.
pub fn tone_power(x: &[f64], fs: f64, frequency: f64, window: Window) -> f64 {
    let w = window.coefficients(x.len());
    let w_sum: f64 = w.iter().sum();
    if w_sum == 0.0 {
        return f64::NAN;
    }
    let omega = 2.0 * PI * frequency / fs;
    let (re, im) = x
        .iter()
        .zip(w.iter())
        .enumerate()
        .fold((0.0, 0.0), |(re, im), (i, (v, w))| {
            let phi = omega * i as f64;
            (re + v * w * phi.cos(), im - v * w * phi.sin())
        });
    (re * re + im * im).sqrt() * SQRT_2 / w_sum
}

pub fn phase(spectrum: &[Complex<f64>]) -> Vec<f64> {
    spectrum.iter().map(|c| c.arg()).collect()
}

/// Remove 2π discontinuities from a phase sequence
pub fn unwrap(phases: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(phases.len());
    let mut offset = 0.0;
    let mut prev: Option<f64> = None;
    for &p in phases {
        if let Some(last) = prev {
            let mut delta = p - last;
            while delta > PI {
                offset -= 2.0 * PI;
                delta -= 2.0 * PI;
            }
            while delta < -PI {
                offset += 2.0 * PI;
                delta += 2.0 * PI;
            }
        }
        out.push(p + offset);
        prev = Some(p);
    }
    out
}

/// Pearson correlation of two equally long signals
pub fn correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return f64::NAN;
    }
    let ma = mean(&a[..n]);
    let mb = mean(&b[..n]);
    let mut num = 0.0;
    let mut da = 0.0;
    let mut dbb = 0.0;
    for i in 0..n {
        let x = a[i] - ma;
        let y = b[i] - mb;
        num += x * y;
        da += x * x;
        dbb += y * y;
    }
    num / (da * dbb).sqrt()
}
