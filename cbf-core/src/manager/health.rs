use cbf_model::HealthState;
use serde::{Deserialize, Serialize};

/// Result of a mesh-link health check.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkHealth {
    pub healthy: bool,
    pub bit_error_rate: f64,
}

impl LinkHealth {
    /// Fold into a health state. Unhealthy links fail; healthy links above
    /// the error-rate ceiling degrade.
    pub fn classify(&self, max_bit_error_rate: f64) -> HealthState {
        if !self.healthy || self.bit_error_rate.is_nan() {
            HealthState::Failed
        } else if self.bit_error_rate > max_bit_error_rate {
            HealthState::Degraded
        } else {
            HealthState::Ok
        }
    }
}

fn severity(state: HealthState) -> u8 {
    match state {
        HealthState::Ok => 0,
        HealthState::Unknown => 1,
        HealthState::Degraded => 2,
        HealthState::Failed => 3,
    }
}

/// Worst of `states`; `Unknown` when there is nothing to aggregate.
pub fn worst(states: impl IntoIterator<Item = HealthState>) -> HealthState {
    states
        .into_iter()
        .max_by_key(|state| severity(*state))
        .unwrap_or(HealthState::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_thresholds() {
        let ceiling = 1e-9;
        let ok = LinkHealth {
            healthy: true,
            bit_error_rate: 1e-12,
        };
        assert_eq!(ok.classify(ceiling), HealthState::Ok);

        let noisy = LinkHealth {
            healthy: true,
            bit_error_rate: 1e-6,
        };
        assert_eq!(noisy.classify(ceiling), HealthState::Degraded);

        let down = LinkHealth {
            healthy: false,
            bit_error_rate: 0.0,
        };
        assert_eq!(down.classify(ceiling), HealthState::Failed);
    }

    #[test]
    fn worst_prefers_failure() {
        assert_eq!(worst([]), HealthState::Unknown);
        assert_eq!(worst([HealthState::Ok, HealthState::Ok]), HealthState::Ok);
        assert_eq!(
            worst([HealthState::Ok, HealthState::Unknown]),
            HealthState::Unknown
        );
        assert_eq!(
            worst([HealthState::Degraded, HealthState::Failed, HealthState::Ok]),
            HealthState::Failed
        );
    }
}
