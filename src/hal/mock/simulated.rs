use crate::hal::{AiPacket, AoPacket, AoRequest, Engine, EngineChannels, EngineConfig};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(20);

/// Give up waiting for analog output after this long and play silence
const AO_TIMEOUT: Duration = Duration::from_secs(2);

/// How analog output reaches the simulated inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopbackSettings {
    #[serde(default = "default_gain")]
    pub gain: f64,

    /// Applied to the sum of all outputs before it reaches every input
    #[serde(default = "default_impulse")]
    pub impulse_response: Vec<f64>,

    /// RMS of uniform noise added to each input
    #[serde(default)]
    pub noise_rms: f64,

    #[serde(default)]
    pub seed: u64,

    /// Pace packets to wall-clock time instead of running as fast as the
    /// consumer allows
    #[serde(default)]
    pub realtime: bool,
}

fn default_gain() -> f64 {
    1.0
}

fn default_impulse() -> Vec<f64> {
    vec![1.0]
}

impl Default for LoopbackSettings {
    fn default() -> Self {
        Self {
            gain: default_gain(),
            impulse_response: default_impulse(),
            noise_rms: 0.0,
            seed: 0,
            realtime: false,
        }
    }
}

struct EngineLinks {
    ai_tx: Sender<AiPacket>,
    ao_request_tx: Sender<AoRequest>,
    ao_rx: Receiver<AoPacket>,
}

/// Engine that plays its outputs straight back into its inputs.
///
/// Every input sees `gain * (h * sum(outputs)) + noise`. Without real-time
/// pacing the engine runs in lock-step with whoever drains its channels,
/// which makes acquisitions deterministic for a given seed.
pub struct SimulatedEngine {
    settings: LoopbackSettings,
    config: Option<EngineConfig>,
    channels: Option<EngineChannels>,
    links: Option<EngineLinks>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedEngine {
    pub fn new(settings: LoopbackSettings) -> Self {
        Self {
            settings,
            config: None,
            channels: None,
            links: None,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new(LoopbackSettings::default())
    }
}

#[async_trait]
impl Engine for SimulatedEngine {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn configure(&mut self, config: EngineConfig) -> Result<()> {
        if self.is_running() {
            bail!("Cannot configure a running engine");
        }
        config.validate()?;
        if self.settings.impulse_response.is_empty() {
            bail!("Loopback impulse response is empty");
        }
        let mut rates = config.channels.iter().map(|c| c.fs);
        if let Some(fs) = rates.next() {
            if rates.any(|other| other != fs) {
                bail!("Simulated engine needs every channel at the same sample rate");
            }
        }

        let (ai_tx, ai_rx) = bounded(2);
        let (ao_request_tx, ao_request_rx) = bounded(2);
        let (ao_tx, ao_rx) = bounded(2);
        self.channels = Some(EngineChannels {
            ai_rx,
            ao_request_rx,
            ao_tx,
        });
        self.links = Some(EngineLinks {
            ai_tx,
            ao_request_tx,
            ao_rx,
        });
        self.config = Some(config);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            bail!("Engine is already running");
        }
        let config = self
            .config
            .clone()
            .ok_or_else(|| anyhow!("Engine has not been configured"))?;
        let links = self
            .links
            .take()
            .ok_or_else(|| anyhow!("Engine must be configured again before restarting"))?;

        let loopback = Loopback::new(&config, self.settings.clone());
        let running = self.running.clone();
        running.store(true, Ordering::Relaxed);
        let handle = std::thread::Builder::new()
            .name("simulated-engine".into())
            .spawn(move || loopback.run(links, running))?;
        self.thread = Some(handle);
        tracing::info!(channels = config.channels.len(), "simulated engine started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            tokio::task::spawn_blocking(move || handle.join())
                .await?
                .map_err(|_| anyhow!("Simulated engine thread panicked"))?;
            tracing::info!("simulated engine stopped");
        }
        Ok(())
    }

    fn get_channels(&mut self) -> Result<EngineChannels> {
        self.channels
            .clone()
            .ok_or_else(|| anyhow!("Engine has not been configured"))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

fn send_while_running<T>(tx: &Sender<T>, mut value: T, running: &AtomicBool) -> bool {
    loop {
        match tx.send_timeout(value, POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(v)) => {
                if !running.load(Ordering::Relaxed) {
                    return false;
                }
                value = v;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

enum AoReply {
    Packet(AoPacket),
    TimedOut,
    Closed,
}

fn recv_while_running(rx: &Receiver<AoPacket>, running: &AtomicBool) -> AoReply {
    let deadline = Instant::now() + AO_TIMEOUT;
    loop {
        match rx.recv_timeout(POLL) {
            Ok(packet) => return AoReply::Packet(packet),
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::Relaxed) {
                    return AoReply::Closed;
                }
                if Instant::now() >= deadline {
                    return AoReply::TimedOut;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return AoReply::Closed,
        }
    }
}

struct OutputLine {
    name: String,
    written: u64,
    buffer: VecDeque<f64>,
}

struct Loopback {
    settings: LoopbackSettings,
    fs: f64,
    period: usize,
    ahead: usize,
    outputs: Vec<OutputLine>,
    inputs: Vec<(String, (f64, f64))>,
    history: Vec<f64>,
    rng: StdRng,
}

impl Loopback {
    fn new(config: &EngineConfig, settings: LoopbackSettings) -> Self {
        let fs = config.channels.first().map(|c| c.fs).unwrap_or(1.0);
        let tail = settings.impulse_response.len().saturating_sub(1);
        Self {
            fs,
            period: ((config.monitor_period * fs).round() as usize).max(1),
            ahead: (config.buffer_size * fs).round() as usize,
            outputs: config
                .outputs()
                .map(|c| OutputLine {
                    name: c.name.clone(),
                    written: 0,
                    buffer: VecDeque::new(),
                })
                .collect(),
            inputs: config
                .inputs()
                .map(|c| (c.name.clone(), c.expected_range))
                .collect(),
            history: vec![0.0; tail],
            rng: StdRng::seed_from_u64(settings.seed),
            settings,
        }
    }

    fn run(mut self, links: EngineLinks, running: Arc<AtomicBool>) {
        let started = Instant::now();
        let mut s0 = 0u64;
        while running.load(Ordering::Relaxed) {
            if !self.fill_outputs(&links, &running, s0) {
                break;
            }
            let drive = self.consume();
            let response = self.respond(&drive);
            for (name, (lower, upper)) in &self.inputs {
                let packet = AiPacket {
                    channel: name.clone(),
                    s0,
                    fs: self.fs,
                    samples: response.iter().map(|v| v.clamp(*lower, *upper)).collect(),
                    timestamp: s0 as f64 / self.fs,
                };
                if !send_while_running(&links.ai_tx, packet, &running) {
                    running.store(false, Ordering::Relaxed);
                    return;
                }
            }
            s0 += self.period as u64;

            if self.settings.realtime {
                let due = started + Duration::from_secs_f64(s0 as f64 / self.fs);
                std::thread::sleep(due.saturating_duration_since(Instant::now()));
            }
        }
        running.store(false, Ordering::Relaxed);
        tracing::debug!(samples = s0, "simulated engine loop exited");
    }

    /// Keep every output buffered `ahead` samples past the next period
    fn fill_outputs(&mut self, links: &EngineLinks, running: &AtomicBool, s0: u64) -> bool {
        let target = s0 + (self.period + self.ahead) as u64;
        for line in self.outputs.iter_mut() {
            while line.written < target {
                let n = (target - line.written) as usize;
                let request = AoRequest {
                    channel: line.name.clone(),
                    s0: line.written,
                    n,
                };
                if !send_while_running(&links.ao_request_tx, request, running) {
                    return false;
                }
                let mut samples = match recv_while_running(&links.ao_rx, running) {
                    AoReply::Packet(packet) => {
                        if packet.channel != line.name {
                            tracing::warn!(expected = %line.name, got = %packet.channel, "output packet for the wrong channel");
                        }
                        packet.samples
                    }
                    AoReply::TimedOut => {
                        tracing::warn!(channel = %line.name, n, "analog output underflow, playing silence");
                        Vec::new()
                    }
                    AoReply::Closed => return false,
                };
                if samples.len() != n {
                    tracing::warn!(channel = %line.name, expected = n, got = samples.len(), "short output packet");
                    samples.resize(n, 0.0);
                }
                line.buffer.extend(samples);
                line.written += n as u64;
            }
        }
        true
    }

    fn consume(&mut self) -> Vec<f64> {
        let mut drive = vec![0.0; self.period];
        for line in self.outputs.iter_mut() {
            for (d, v) in drive.iter_mut().zip(line.buffer.drain(..self.period)) {
                *d += v;
            }
        }
        drive
    }

    fn respond(&mut self, drive: &[f64]) -> Vec<f64> {
        let h = &self.settings.impulse_response;
        let tail = self.history.len();
        let mut x = std::mem::take(&mut self.history);
        x.extend_from_slice(drive);

        let noise_amplitude = self.settings.noise_rms * 3f64.sqrt();
        let mut response = Vec::with_capacity(drive.len());
        for i in 0..drive.len() {
            let n = i + tail;
            let y: f64 = h.iter().enumerate().map(|(k, hk)| hk * x[n - k]).sum();
            let noise = if noise_amplitude > 0.0 {
                noise_amplitude * self.rng.gen_range(-1.0..1.0)
            } else {
                0.0
            };
            response.push(self.settings.gain * y + noise);
        }

        self.history = x[x.len() - tail..].to_vec();
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::ChannelConfig;

    fn config() -> EngineConfig {
        EngineConfig {
            monitor_period: 0.01,
            buffer_size: 0.0,
            channels: vec![
                ChannelConfig::output("speaker", 1000.0),
                ChannelConfig::input("microphone", 1000.0),
            ],
        }
    }

    #[tokio::test]
    async fn test_loopback_applies_impulse_response() {
        let mut engine = SimulatedEngine::new(LoopbackSettings {
            gain: 0.5,
            impulse_response: vec![0.0, 1.0],
            ..Default::default()
        });
        engine.configure(config()).await.unwrap();
        let channels = engine.get_channels().unwrap();
        engine.start().await.unwrap();

        let mut acquired = Vec::new();
        while acquired.len() < 20 {
            crossbeam_channel::select! {
                recv(channels.ao_request_rx) -> request => {
                    let request = request.unwrap();
                    let ramp = (request.s0..request.s0 + request.n as u64).map(|v| v as f64).collect();
                    channels.write_ao(&request.channel, request.s0, ramp).unwrap();
                }
                recv(channels.ai_rx) -> packet => {
                    let packet = packet.unwrap();
                    assert_eq!(packet.s0 as usize, acquired.len());
                    acquired.extend(packet.samples);
                }
            }
        }
        engine.stop().await.unwrap();

        assert_eq!(acquired[0], 0.0);
        assert_eq!(acquired[1], 0.0);
        assert_eq!(acquired[5], 2.0);
        assert_eq!(acquired[15], 7.0);
    }

    #[tokio::test]
    async fn test_mixed_rates_rejected() {
        let mut engine = SimulatedEngine::default();
        let config = EngineConfig::default()
            .with_channel(ChannelConfig::output("speaker", 1000.0))
            .with_channel(ChannelConfig::input("microphone", 2000.0));
        assert!(engine.configure(config).await.is_err());
        assert!(engine.get_channels().is_err());
    }
}
