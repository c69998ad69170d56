//! Gain-ripple correction coefficients.

use crate::config::GainConfig;
use crate::error::{CbfError, Result};

/// Turns filter-response magnitudes `|H|` into `scale / |H|` gains.
///
/// The response itself is computed elsewhere; only the scale is ours, and
/// it always comes from configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RippleCorrection {
    scale: f64,
}

impl RippleCorrection {
    pub fn new(scale: f64) -> Result<Self> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(CbfError::Validation(format!(
                "ripple scale must be finite and positive, got {scale}"
            )));
        }
        Ok(Self { scale })
    }

    pub fn from_config(config: &GainConfig) -> Result<Self> {
        Self::new(config.ripple_scale)
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// One coefficient per magnitude. Zero or non-finite magnitudes are
    /// rejected rather than producing infinite gains.
    pub fn coefficients(&self, magnitudes: &[f64]) -> Result<Vec<f64>> {
        magnitudes
            .iter()
            .enumerate()
            .map(|(index, magnitude)| {
                if magnitude.is_finite() && *magnitude > 0.0 {
                    Ok(self.scale / magnitude)
                } else {
                    Err(CbfError::Validation(format!(
                        "magnitude {magnitude} at channel {index} cannot be corrected"
                    )))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coefficients_use_configured_scale() {
        let unity = RippleCorrection::from_config(&GainConfig::default()).unwrap();
        assert_eq!(unity.coefficients(&[0.5, 1.0, 2.0]).unwrap(), vec![2.0, 1.0, 0.5]);

        let trimmed = RippleCorrection::new(0.99).unwrap();
        let gains = trimmed.coefficients(&[0.99]).unwrap();
        assert!((gains[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(RippleCorrection::new(0.0).is_err());
        assert!(RippleCorrection::new(f64::NAN).is_err());
        let unity = RippleCorrection::new(1.0).unwrap();
        assert!(unity.coefficients(&[1.0, 0.0]).is_err());
    }
}
