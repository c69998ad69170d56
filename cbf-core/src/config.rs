//! Controller configuration types.
//!
//! These structures are shared with the `cbf-config` crate, which owns
//! loading and guard-rail validation. Every field carries a default so a
//! deployment can override only the knobs it cares about.

use std::collections::BTreeMap;
use std::time::Duration;

use cbf_model::{FspId, ProcessingMode, ReceptorId, VccId};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Global knobs for the control core.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ControllerConfig {
    /// Per-device command queue sizing and event fan-out.
    pub commands: CommandQueueConfig,
    /// Timeouts applied to every remote proxy call.
    pub remote: RemoteCallConfig,
    /// Retry budget for timed-out or transport-failed calls.
    pub retry: RetryConfig,
    /// Spectrum geometry tuning.
    pub spectrum: SpectrumConfig,
    /// Mesh-link health thresholds.
    pub links: LinkConfig,
    /// Gain-ripple correction scale.
    pub gain: GainConfig,
    /// Interface allow-list overrides keyed by command name.
    pub interfaces: InterfaceConfig,
    /// Processing units and receptors the resource pool is seeded with.
    pub inventory: InventoryConfig,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandQueueConfig {
    /// Maximum number of unfinished commands per device.
    pub queue_capacity: usize,
    /// Capacity of the broadcast channel carrying command events.
    pub event_channel_capacity: usize,
}

impl Default for CommandQueueConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            event_channel_capacity: 256,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteCallConfig {
    pub call_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl RemoteCallConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for RemoteCallConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 3_000,
            handshake_timeout_ms: 2_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per remote call, including the first.
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Delay before retry number `attempt` (1-based), exponential with
    /// jitter and capped at `backoff_max`.
    pub fn delay_for(&self, attempt: u16) -> Duration {
        let exponent = u32::from(attempt.saturating_sub(1)).min(16);
        let raw = self
            .backoff_base()
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(self.backoff_max());

        let ratio = f64::from(self.jitter_ratio.clamp(0.0, 1.0));
        if ratio == 0.0 || raw.is_zero() {
            return raw;
        }
        let spread = rand::rng().random_range(-ratio..=ratio);
        raw.mul_f64(1.0 + spread).min(self.backoff_max())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 2_000,
            jitter_ratio: 0.2,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrumConfig {
    /// Frequency shift applied per unit of k-offset (Hz).
    pub k_offset_step_hz: i64,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            k_offset_step_hz: 1_800,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Links reporting a higher bit-error rate degrade device health.
    pub max_bit_error_rate: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_bit_error_rate: 1e-9,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GainConfig {
    /// Numerator of the `scale / |H|` ripple correction.
    pub ripple_scale: f64,
}

impl Default for GainConfig {
    fn default() -> Self {
        Self { ripple_scale: 1.0 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct InterfaceConfig {
    /// Replaces the built-in allow-list for the named commands.
    pub allow_list: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct InventoryConfig {
    pub fsps: Vec<FspInventoryEntry>,
    pub receptors: Vec<ReceptorMapping>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FspInventoryEntry {
    pub id: FspId,
    /// Modes the unit can run. Empty means every mode.
    #[serde(default)]
    pub modes: Vec<ProcessingMode>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceptorMapping {
    pub receptor: ReceptorId,
    pub vcc: VccId,
}
