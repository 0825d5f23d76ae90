use crate::calibration::{Calibration, CalibrationHandle};
use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

/// Signal direction of an analog line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

/// One physical analog line as described in the engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub direction: Direction,
    pub fs: f64,

    /// Voltage range the line is expected to stay within
    #[serde(default = "default_expected_range")]
    pub expected_range: (f64, f64),

    /// Starting calibration; unity when absent
    #[serde(default)]
    pub calibration: Option<Calibration>,
}

fn default_expected_range() -> (f64, f64) {
    (-10.0, 10.0)
}

impl ChannelConfig {
    pub fn input(name: impl Into<String>, fs: f64) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Input,
            fs,
            expected_range: default_expected_range(),
            calibration: None,
        }
    }

    pub fn output(name: impl Into<String>, fs: f64) -> Self {
        Self {
            direction: Direction::Output,
            ..Self::input(name, fs)
        }
    }
}

/// Runtime view of a channel. The calibration handle is shared with every
/// stage and waveform factory that reads it.
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub direction: Direction,
    pub fs: f64,
    pub expected_range: (f64, f64),
    pub calibration: CalibrationHandle,
}

impl From<&ChannelConfig> for Channel {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            name: config.name.clone(),
            direction: config.direction,
            fs: config.fs,
            expected_range: config.expected_range,
            calibration: CalibrationHandle::new(config.calibration.clone().unwrap_or_default()),
        }
    }
}

impl Channel {
    pub fn in_range(&self, value: f64) -> bool {
        value >= self.expected_range.0 && value <= self.expected_range.1
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between analog-input packets
    #[serde(default = "default_monitor_period")]
    pub monitor_period: f64,

    /// Seconds of analog output kept queued ahead of playback
    #[serde(default = "default_buffer_size")]
    pub buffer_size: f64,

    pub channels: Vec<ChannelConfig>,
}

fn default_monitor_period() -> f64 {
    0.1
}

fn default_buffer_size() -> f64 {
    0.5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            monitor_period: default_monitor_period(),
            buffer_size: default_buffer_size(),
            channels: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn channel(&self, name: &str) -> Result<&ChannelConfig> {
        self.channels
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| anyhow!("Unknown channel: {}", name))
    }

    pub fn inputs(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels
            .iter()
            .filter(|c| c.direction == Direction::Input)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels
            .iter()
            .filter(|c| c.direction == Direction::Output)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.monitor_period > 0.0) {
            bail!("Monitor period must be positive");
        }
        if !(self.buffer_size >= 0.0) {
            bail!("Buffer size must be non-negative");
        }
        for (i, channel) in self.channels.iter().enumerate() {
            if !(channel.fs > 0.0) {
                bail!("Channel {} has invalid sample rate {}", channel.name, channel.fs);
            }
            if channel.expected_range.0 >= channel.expected_range.1 {
                bail!("Channel {} has an empty expected range", channel.name);
            }
            if self.channels[..i].iter().any(|c| c.name == channel.name) {
                bail!("Duplicate channel name: {}", channel.name);
            }
        }
        Ok(())
    }
}

/// Analog-input samples delivered once per monitor period
#[derive(Debug, Clone)]
pub struct AiPacket {
    pub channel: String,
    /// Index of the first sample since the engine started
    pub s0: u64,
    pub fs: f64,
    pub samples: Vec<f64>,
    /// Seconds since the engine started
    pub timestamp: f64,
}

/// Engine asking for the next `n` output samples of a channel
#[derive(Debug, Clone, PartialEq)]
pub struct AoRequest {
    pub channel: String,
    pub s0: u64,
    pub n: usize,
}

/// Answer to an [`AoRequest`]
#[derive(Debug, Clone)]
pub struct AoPacket {
    pub channel: String,
    pub s0: u64,
    pub samples: Vec<f64>,
}

/// Channels connecting an engine to the acquisition loop
#[derive(Clone)]
pub struct EngineChannels {
    /// Filled analog-input packets from the hardware
    pub ai_rx: Receiver<AiPacket>,
    /// Requests for more analog output
    pub ao_request_rx: Receiver<AoRequest>,
    /// Analog output going back to the hardware
    pub ao_tx: Sender<AoPacket>,
}

impl EngineChannels {
    pub fn write_ao(&self, channel: &str, s0: u64, samples: Vec<f64>) -> Result<()> {
        self.ao_tx
            .send(AoPacket {
                channel: channel.to_string(),
                s0,
                samples,
            })
            .map_err(|_| anyhow!("Engine stopped accepting output for {}", channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "monitor_period": 0.05,
            "channels": [
                {"name": "speaker", "direction": "output", "fs": 100000.0},
                {"name": "microphone", "direction": "input", "fs": 100000.0,
                 "calibration": {"type": "flat", "sensitivity": -40.0, "fixed_gain": 0.0}}
            ]
        }))
        .unwrap();
        assert_eq!(config.buffer_size, 0.5);
        assert_eq!(config.outputs().count(), 1);
        let mic = Channel::from(config.channel("microphone").unwrap());
        assert_eq!(mic.calibration.get(), Calibration::flat(-40.0));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let config = EngineConfig::default()
            .with_channel(ChannelConfig::input("a", 1000.0))
            .with_channel(ChannelConfig::output("a", 1000.0));
        assert!(config.validate().is_err());
    }
}
