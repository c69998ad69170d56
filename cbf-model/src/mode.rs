use crate::error::{ModelError, Result};
use std::fmt;
use std::str::FromStr;

/// Function an FSP performs over its frequency slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProcessingMode {
    #[cfg_attr(feature = "serde", serde(rename = "CORR"))]
    Corr,
    #[cfg_attr(feature = "serde", serde(rename = "PSS-BF", alias = "PSS"))]
    Pss,
    #[cfg_attr(feature = "serde", serde(rename = "PST-BF", alias = "PST"))]
    Pst,
    #[cfg_attr(feature = "serde", serde(rename = "VLBI"))]
    Vlbi,
}

impl ProcessingMode {
    pub fn all() -> &'static [Self] {
        &[
            ProcessingMode::Corr,
            ProcessingMode::Pss,
            ProcessingMode::Pst,
            ProcessingMode::Vlbi,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::Corr => "CORR",
            ProcessingMode::Pss => "PSS-BF",
            ProcessingMode::Pst => "PST-BF",
            ProcessingMode::Vlbi => "VLBI",
        }
    }
}

impl FromStr for ProcessingMode {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CORR" => Ok(ProcessingMode::Corr),
            "PSS-BF" | "PSS" => Ok(ProcessingMode::Pss),
            "PST-BF" | "PST" => Ok(ProcessingMode::Pst),
            "VLBI" => Ok(ProcessingMode::Vlbi),
            other => Err(ModelError::InvalidEnum {
                kind: "processing mode",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver band selected for a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FrequencyBand {
    #[cfg_attr(feature = "serde", serde(rename = "1"))]
    Band1,
    #[cfg_attr(feature = "serde", serde(rename = "2"))]
    Band2,
    #[cfg_attr(feature = "serde", serde(rename = "3"))]
    Band3,
    #[cfg_attr(feature = "serde", serde(rename = "4"))]
    Band4,
    #[cfg_attr(feature = "serde", serde(rename = "5a"))]
    Band5a,
    #[cfg_attr(feature = "serde", serde(rename = "5b"))]
    Band5b,
}

impl FrequencyBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrequencyBand::Band1 => "1",
            FrequencyBand::Band2 => "2",
            FrequencyBand::Band3 => "3",
            FrequencyBand::Band4 => "4",
            FrequencyBand::Band5a => "5a",
            FrequencyBand::Band5b => "5b",
        }
    }

    /// Bands 5a/5b are down-converted and need a stream tuning value.
    pub fn requires_stream_tuning(&self) -> bool {
        matches!(self, FrequencyBand::Band5a | FrequencyBand::Band5b)
    }
}

impl FromStr for FrequencyBand {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1" => Ok(FrequencyBand::Band1),
            "2" => Ok(FrequencyBand::Band2),
            "3" => Ok(FrequencyBand::Band3),
            "4" => Ok(FrequencyBand::Band4),
            "5a" => Ok(FrequencyBand::Band5a),
            "5b" => Ok(FrequencyBand::Band5b),
            other => Err(ModelError::InvalidEnum {
                kind: "frequency band",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for FrequencyBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
