//! Spectrum partitioning: coarse-channel lookup and per-FSP channel ranges.
//!
//! All frequencies are integer Hz so band edges compare exactly.

use std::collections::BTreeSet;

use cbf_model::FspId;
use serde::{Deserialize, Serialize};

use crate::error::{CbfError, Result};

/// Bandwidth of one coarse channel (frequency slice), in Hz.
pub const FS_BW_HZ: i64 = 198_180_864;

/// Number of coarse channels in the boundary table.
pub const COARSE_CHANNEL_COUNT: u32 = 10;

/// Largest accepted k-offset.
pub const MAX_K_OFFSET: i64 = 2222;

const HALF_FS_BW_HZ: i64 = FS_BW_HZ / 2;

/// Coarse-channel edges for one tuning shift.
///
/// Channel `n` covers `[edge(n), edge(n + 1))` where
/// `edge(n) = n * FS_BW - FS_BW / 2 + shift`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoarseChannelTable {
    shift_hz: i64,
}

impl CoarseChannelTable {
    pub fn new(shift_hz: i64) -> Self {
        Self { shift_hz }
    }

    pub fn edge(&self, n: u32) -> i64 {
        i64::from(n) * FS_BW_HZ - HALF_FS_BW_HZ + self.shift_hz
    }

    /// All `COARSE_CHANNEL_COUNT + 1` edges, ascending.
    pub fn edges(&self) -> Vec<i64> {
        (0..=COARSE_CHANNEL_COUNT).map(|n| self.edge(n)).collect()
    }

    pub fn lower_bound(&self) -> i64 {
        self.edge(0)
    }

    pub fn upper_bound(&self) -> i64 {
        self.edge(COARSE_CHANNEL_COUNT)
    }

    fn channel_containing(&self, freq: i64) -> u32 {
        // Callers clamp `freq` into the table first.
        let offset = (freq - self.lower_bound()) / FS_BW_HZ;
        u32::try_from(offset)
            .unwrap_or(0)
            .min(COARSE_CHANNEL_COUNT - 1)
    }

    /// Coarse channels overlapping the half-open window `[start, end)`.
    /// A zero-width window selects the channel containing `start`.
    pub fn channels_for(&self, start: i64, end: i64) -> Result<Vec<u32>> {
        if start > end {
            return Err(CbfError::InvalidRange(format!(
                "start frequency {start} Hz exceeds end frequency {end} Hz"
            )));
        }

        let (lower, upper) = (self.lower_bound(), self.upper_bound());
        let outside = if start == end {
            start < lower || start >= upper
        } else {
            end <= lower || start >= upper
        };
        if outside {
            return Err(CbfError::InvalidRange(format!(
                "window [{start}, {end}) Hz lies outside coarse channels \
                 [{lower}, {upper}) Hz"
            )));
        }

        let first = self.channel_containing(start.max(lower));
        let last = if start == end {
            first
        } else {
            self.channel_containing(end.min(upper) - 1)
        };
        Ok((first..=last).collect())
    }
}

/// Inclusive range of coarse-channel indices overlapping
/// `[start_freq, end_freq)`, with the table shifted by `wideband_shift`.
pub fn get_coarse_channels(
    start_freq: i64,
    end_freq: i64,
    wideband_shift: i64,
) -> Result<Vec<u32>> {
    CoarseChannelTable::new(wideband_shift).channels_for(start_freq, end_freq)
}

/// Contiguous channel range assigned to one FSP for one scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencySlice {
    /// First coarse channel the slice touches.
    pub id: u32,
    pub fsp_id: FspId,
    pub start_channel: u32,
    /// Inclusive.
    pub end_channel: u32,
    pub start_freq_hz: i64,
    /// Exclusive.
    pub end_freq_hz: i64,
    pub coarse_channels: Vec<u32>,
}

impl FrequencySlice {
    pub fn channel_count(&self) -> u32 {
        self.end_channel - self.start_channel + 1
    }

    pub fn contains_channel(&self, channel: u32) -> bool {
        (self.start_channel..=self.end_channel).contains(&channel)
    }
}

/// Loosely-typed partition input, as it arrives from a configuration
/// document. Every field is mandatory; `None` is rejected, never defaulted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRequest {
    pub fsp_ids: Option<Vec<i64>>,
    pub start_freq: Option<i64>,
    pub channel_width: Option<i64>,
    pub channel_count: Option<i64>,
    pub k_offset: Option<i64>,
    pub wideband_shift: Option<i64>,
}

struct ValidatedRequest {
    fsp_ids: Vec<FspId>,
    start_freq: i64,
    channel_width: i64,
    channel_count: u32,
    shift_hz: i64,
}

fn required(value: Option<i64>, name: &str) -> Result<i64> {
    value.ok_or_else(|| CbfError::Validation(format!("{name} is required")))
}

/// Splits a channel window across FSPs.
#[derive(Clone, Copy, Debug)]
pub struct SpectrumPartitioner {
    k_offset_step_hz: i64,
}

impl Default for SpectrumPartitioner {
    fn default() -> Self {
        Self::new(crate::config::SpectrumConfig::default().k_offset_step_hz)
    }
}

impl SpectrumPartitioner {
    pub fn new(k_offset_step_hz: i64) -> Self {
        Self { k_offset_step_hz }
    }

    /// Table shift for a wideband shift and k-offset pair.
    pub fn shift_for(&self, wideband_shift: i64, k_offset: i64) -> i64 {
        wideband_shift + k_offset * self.k_offset_step_hz
    }

    fn validate(&self, request: &PartitionRequest) -> Result<ValidatedRequest> {
        let raw_ids = match request.fsp_ids.as_deref() {
            Some(ids) if !ids.is_empty() => ids,
            _ => {
                return Err(CbfError::Validation(
                    "fsp_ids must be a non-empty list".to_string(),
                ));
            }
        };
        let mut seen = BTreeSet::new();
        let mut fsp_ids = Vec::with_capacity(raw_ids.len());
        for raw in raw_ids {
            let id = FspId::try_from(*raw)?;
            if !seen.insert(id) {
                return Err(CbfError::Validation(format!(
                    "fsp id {id} listed more than once"
                )));
            }
            fsp_ids.push(id);
        }

        let start_freq = required(request.start_freq, "start_freq")?;
        if start_freq < 0 {
            return Err(CbfError::Validation(format!(
                "start_freq must be non-negative, got {start_freq}"
            )));
        }

        let channel_width = required(request.channel_width, "channel_width")?;
        if channel_width <= 0 {
            return Err(CbfError::Validation(format!(
                "channel_width must be positive, got {channel_width}"
            )));
        }

        let channel_count = required(request.channel_count, "channel_count")?;
        if channel_count <= 0 {
            return Err(CbfError::Validation(format!(
                "channel_count must be positive, got {channel_count}"
            )));
        }
        let channel_count = u32::try_from(channel_count).map_err(|_| {
            CbfError::Validation(format!(
                "channel_count {channel_count} is too large"
            ))
        })?;

        let k_offset = required(request.k_offset, "k_offset")?;
        if !(0..=MAX_K_OFFSET).contains(&k_offset) {
            return Err(CbfError::Validation(format!(
                "k_offset {k_offset} outside 0..={MAX_K_OFFSET}"
            )));
        }

        let wideband_shift =
            required(request.wideband_shift, "wideband_shift")?;

        Ok(ValidatedRequest {
            fsp_ids,
            start_freq,
            channel_width,
            channel_count,
            shift_hz: self.shift_for(wideband_shift, k_offset),
        })
    }

    /// Divide `channel_count` channels into contiguous, equal-sized chunks
    /// (the last may be shorter), one per FSP, in caller order.
    pub fn partition(
        &self,
        request: &PartitionRequest,
    ) -> Result<Vec<FrequencySlice>> {
        let validated = self.validate(request)?;
        let table = CoarseChannelTable::new(validated.shift_hz);

        let total_bandwidth = i64::from(validated.channel_count)
            .checked_mul(validated.channel_width)
            .ok_or_else(|| {
                CbfError::Validation("total bandwidth overflows".to_string())
            })?;
        let end_of_window = validated
            .start_freq
            .checked_add(total_bandwidth)
            .ok_or_else(|| {
                CbfError::Validation("channel window end overflows".to_string())
            })?;

        let fsp_count = validated.fsp_ids.len() as u32;
        let chunk = validated.channel_count.div_ceil(fsp_count);

        let mut slices = Vec::with_capacity(validated.fsp_ids.len());
        let mut next_channel = 0u32;
        for fsp_id in &validated.fsp_ids {
            if next_channel >= validated.channel_count {
                break;
            }
            let count = chunk.min(validated.channel_count - next_channel);
            let start_freq_hz = validated.start_freq
                + i64::from(next_channel) * validated.channel_width;
            let end_freq_hz = (start_freq_hz
                + i64::from(count) * validated.channel_width)
                .min(end_of_window);
            let coarse_channels = table
                .channels_for(start_freq_hz, end_freq_hz)
                .map_err(|err| match err {
                    CbfError::InvalidRange(message) => CbfError::Validation(message),
                    other => other,
                })?;

            slices.push(FrequencySlice {
                id: coarse_channels[0],
                fsp_id: *fsp_id,
                start_channel: next_channel,
                end_channel: next_channel + count - 1,
                start_freq_hz,
                end_freq_hz,
                coarse_channels,
            });
            next_channel += count;
        }

        if slices.len() < validated.fsp_ids.len() {
            let idle: Vec<String> = validated.fsp_ids[slices.len()..]
                .iter()
                .map(ToString::to_string)
                .collect();
            return Err(CbfError::Validation(format!(
                "{} channels leave fsp(s) {} without work",
                validated.channel_count,
                idle.join(",")
            )));
        }

        Ok(slices)
    }
}

/// Convenience wrapper over [`SpectrumPartitioner::partition`] with the
/// default k-offset step.
pub fn partition_spectrum(
    fsp_ids: &[i64],
    start_freq: i64,
    channel_width: i64,
    channel_count: i64,
    k_offset: i64,
    wideband_shift: i64,
) -> Result<Vec<FrequencySlice>> {
    SpectrumPartitioner::default().partition(&PartitionRequest {
        fsp_ids: Some(fsp_ids.to_vec()),
        start_freq: Some(start_freq),
        channel_width: Some(channel_width),
        channel_count: Some(channel_count),
        k_offset: Some(k_offset),
        wideband_shift: Some(wideband_shift),
    })
}
