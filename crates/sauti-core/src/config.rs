//! Configuration types for the Sauti relay core

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Delivery and accumulation tuning for one relay instance.
///
/// All durations are milliseconds. The defaults are starting points, not
/// contracts: the idle timeout trades response truncation against added
/// latency, and the unit-duration bands trade time-to-first-sound against
/// per-chunk overhead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Target delivery-unit duration for medium-length responses
    #[serde(default = "default_target_unit_ms")]
    pub target_unit_ms: u64,

    /// Lower clamp on the chosen unit duration
    #[serde(default = "default_min_unit_ms")]
    pub min_unit_ms: u64,

    /// Upper clamp on the chosen unit duration
    #[serde(default = "default_max_unit_ms")]
    pub max_unit_ms: u64,

    /// Maximum acceptable playback delay implied by one unit
    #[serde(default = "default_latency_budget_ms")]
    pub latency_budget_ms: u64,

    /// Number of parallel delivery lanes
    #[serde(default = "default_lane_count")]
    pub lane_count: usize,

    /// Pause between two units on the same lane
    #[serde(default = "default_inter_unit_delay_ms")]
    pub inter_unit_delay_ms: u64,

    /// Stagger between lane start times
    #[serde(default = "default_inter_lane_delay_ms")]
    pub inter_lane_delay_ms: u64,

    /// Pause between units on the single-lane fallback path
    #[serde(default = "default_fallback_unit_delay_ms")]
    pub fallback_unit_delay_ms: u64,

    /// Idle window after the last fragment before a turn is considered done
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Hard ceiling from the first fragment, so a turn completes even under
    /// continuous fragment arrival
    #[serde(default = "default_force_completion_ceiling_ms")]
    pub force_completion_ceiling_ms: u64,

    /// How long the interrupted flag stays set before the conversation
    /// accepts a fresh turn
    #[serde(default = "default_resume_delay_ms")]
    pub resume_delay_ms: u64,

    /// Format assumed for headerless raw PCM fragments
    #[serde(default)]
    pub fallback_format: PcmFormat,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            target_unit_ms: default_target_unit_ms(),
            min_unit_ms: default_min_unit_ms(),
            max_unit_ms: default_max_unit_ms(),
            latency_budget_ms: default_latency_budget_ms(),
            lane_count: default_lane_count(),
            inter_unit_delay_ms: default_inter_unit_delay_ms(),
            inter_lane_delay_ms: default_inter_lane_delay_ms(),
            fallback_unit_delay_ms: default_fallback_unit_delay_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            force_completion_ceiling_ms: default_force_completion_ceiling_ms(),
            resume_delay_ms: default_resume_delay_ms(),
            fallback_format: PcmFormat::default(),
        }
    }
}

impl DeliveryConfig {
    /// Validate field relationships that serde defaults cannot enforce.
    pub fn validate(&self) -> Result<()> {
        if self.lane_count == 0 {
            return Err(Error::ConfigError("lane_count must be at least 1".into()));
        }
        if self.min_unit_ms == 0 {
            return Err(Error::ConfigError("min_unit_ms must be non-zero".into()));
        }
        if self.min_unit_ms > self.max_unit_ms {
            return Err(Error::ConfigError(format!(
                "min_unit_ms ({}) exceeds max_unit_ms ({})",
                self.min_unit_ms, self.max_unit_ms
            )));
        }
        if self.idle_timeout_ms == 0 {
            return Err(Error::ConfigError("idle_timeout_ms must be non-zero".into()));
        }
        if self.force_completion_ceiling_ms < self.idle_timeout_ms {
            return Err(Error::ConfigError(format!(
                "force_completion_ceiling_ms ({}) is below idle_timeout_ms ({})",
                self.force_completion_ceiling_ms, self.idle_timeout_ms
            )));
        }
        self.fallback_format.validate()
    }
}

fn default_target_unit_ms() -> u64 {
    2000
}

fn default_min_unit_ms() -> u64 {
    500
}

fn default_max_unit_ms() -> u64 {
    3000
}

fn default_latency_budget_ms() -> u64 {
    1500
}

fn default_lane_count() -> usize {
    2
}

fn default_inter_unit_delay_ms() -> u64 {
    40
}

fn default_inter_lane_delay_ms() -> u64 {
    20
}

fn default_fallback_unit_delay_ms() -> u64 {
    120
}

fn default_idle_timeout_ms() -> u64 {
    800
}

fn default_force_completion_ceiling_ms() -> u64 {
    2000
}

fn default_resume_delay_ms() -> u64 {
    250
}

/// PCM sample format, used both as the assumed layout of headerless
/// fragments and for synthesizing fallback audio.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PcmFormat {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_channels")]
    pub channels: u16,

    #[serde(default = "default_bits_per_sample")]
    pub bits_per_sample: u16,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            bits_per_sample: default_bits_per_sample(),
        }
    }
}

impl PcmFormat {
    /// Bytes of sample data per second of playback.
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    /// Bytes per interleaved sample frame (one sample per channel).
    pub fn frame_size(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::ConfigError("sample_rate must be non-zero".into()));
        }
        if self.channels == 0 || self.channels > 2 {
            return Err(Error::ConfigError(format!(
                "unsupported channel count: {}",
                self.channels
            )));
        }
        if self.bits_per_sample != 8 && self.bits_per_sample != 16 && self.bits_per_sample != 32 {
            return Err(Error::ConfigError(format!(
                "unsupported bit depth: {}",
                self.bits_per_sample
            )));
        }
        Ok(())
    }
}

fn default_sample_rate() -> u32 {
    24000
}

fn default_channels() -> u16 {
    1
}

fn default_bits_per_sample() -> u16 {
    16
}
