use std::collections::BTreeSet;

use cbf_model::{FrequencyBand, ProcessingMode, ReceptorId};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{CbfError, Result};
use crate::spectrum::PartitionRequest;

/// Fields of a scan-configuration document shared by every processing mode.
///
/// Spectrum fields stay optional here so the partitioner can reject a
/// missing value with a precise message instead of serde guessing a default.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub config_id: String,
    pub frequency_band: Option<FrequencyBand>,
    #[serde(default)]
    pub band_5_tuning: Option<Vec<f64>>,
    #[serde(default, deserialize_with = "integral_hz")]
    pub start_freq: Option<i64>,
    #[serde(default, deserialize_with = "integral_hz")]
    pub channel_width: Option<i64>,
    #[serde(default, deserialize_with = "integral_hz")]
    pub channel_count: Option<i64>,
    #[serde(default, deserialize_with = "integral_hz")]
    pub k_offset: Option<i64>,
    #[serde(default, deserialize_with = "integral_hz")]
    pub wideband_shift: Option<i64>,
    #[serde(default)]
    pub fsp_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub receptor_ids: BTreeSet<ReceptorId>,
    #[serde(default, rename = "function_mode")]
    pub processing_mode: Option<ProcessingMode>,
    #[serde(default)]
    pub delay_model_subscription_point: Option<String>,
}

// Documents often carry frequencies in exponent form (`350e6`).
fn integral_hz<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(number) = Option::<serde_json::Number>::deserialize(deserializer)?
    else {
        return Ok(None);
    };
    if let Some(value) = number.as_i64() {
        return Ok(Some(value));
    }
    match number.as_f64() {
        Some(value)
            if value.fract() == 0.0 && value.abs() < i64::MAX as f64 =>
        {
            Ok(Some(value as i64))
        }
        _ => Err(D::Error::custom(format!("{number} is not a whole number"))),
    }
}

impl ScanRequest {
    pub fn from_document(document: &Value) -> Result<Self> {
        Self::deserialize(document).map_err(|err| {
            CbfError::Validation(format!("malformed scan configuration: {err}"))
        })
    }

    pub fn frequency_band(&self) -> Result<FrequencyBand> {
        self.frequency_band.ok_or_else(|| {
            CbfError::Validation("frequency_band is required".to_string())
        })
    }

    /// Total requested bandwidth in Hz, when both factors are present.
    pub fn bandwidth_hz(&self) -> Option<i64> {
        self.channel_count?.checked_mul(self.channel_width?)
    }

    pub fn partition_request(&self, fsp_ids: Vec<i64>) -> PartitionRequest {
        PartitionRequest {
            fsp_ids: Some(fsp_ids),
            start_freq: self.start_freq,
            channel_width: self.channel_width,
            channel_count: self.channel_count,
            k_offset: self.k_offset,
            wideband_shift: self.wideband_shift,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exponent_frequencies_are_accepted() {
        let request = ScanRequest::from_document(&json!({
            "frequency_band": "1",
            "start_freq": 350e6,
            "channel_width": 13440,
            "channel_count": 58980,
            "k_offset": 1000,
            "wideband_shift": 52.7e6,
            "receptor_ids": ["SKA001", "SKA036"],
            "function_mode": "CORR"
        }))
        .unwrap();
        assert_eq!(request.start_freq, Some(350_000_000));
        assert_eq!(request.wideband_shift, Some(52_700_000));
        assert_eq!(request.processing_mode, Some(ProcessingMode::Corr));
        assert_eq!(request.receptor_ids.len(), 2);
        assert_eq!(request.bandwidth_hz(), Some(58_980 * 13_440));
    }

    #[test]
    fn fractional_frequencies_and_bad_receptors_are_rejected() {
        let fractional =
            ScanRequest::from_document(&json!({"start_freq": 350.5}));
        assert!(matches!(fractional, Err(CbfError::Validation(_))));

        let receptor =
            ScanRequest::from_document(&json!({"receptor_ids": ["DISH1"]}));
        assert!(matches!(receptor, Err(CbfError::Validation(_))));
    }
}
