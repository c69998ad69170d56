//! Guard rails applied to every loaded configuration.
//!
//! Hard errors are collected and reported together; softer problems come
//! back as warnings and never block startup.

use std::collections::{BTreeMap, BTreeSet};

use cbf_core::ControllerConfig;
use thiserror::Error;

/// Every guard rail the configuration violated.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("configuration failed {} guard rail(s): {}", .issues.len(), .issues.join("; "))]
pub struct ConfigGuardRailError {
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigWarnings(Vec<ConfigWarning>);

impl ConfigWarnings {
    fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.push(ConfigWarning {
            field,
            message: message.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn fields(&self) -> Vec<&'static str> {
        self.0.iter().map(|warning| warning.field).collect()
    }
}

pub fn apply_guard_rails(
    config: &ControllerConfig,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut issues = Vec::new();
    let mut warnings = ConfigWarnings::default();

    if config.commands.queue_capacity == 0 {
        issues.push("commands.queue_capacity must be at least 1".to_string());
    }
    if config.commands.event_channel_capacity == 0 {
        issues.push(
            "commands.event_channel_capacity must be at least 1".to_string(),
        );
    } else if config.commands.event_channel_capacity
        < config.commands.queue_capacity
    {
        warnings.push(
            "commands.event_channel_capacity",
            format!(
                "event channel ({}) is smaller than the queue ({}); slow subscribers will lag",
                config.commands.event_channel_capacity,
                config.commands.queue_capacity
            ),
        );
    }

    if config.remote.call_timeout_ms == 0 {
        issues.push("remote.call_timeout_ms must be greater than 0".to_string());
    }
    if config.remote.handshake_timeout_ms == 0 {
        issues.push(
            "remote.handshake_timeout_ms must be greater than 0".to_string(),
        );
    }

    if config.retry.max_attempts == 0 {
        issues.push("retry.max_attempts must be at least 1".to_string());
    }
    if config.retry.backoff_base_ms > config.retry.backoff_max_ms {
        warnings.push(
            "retry.backoff_base_ms",
            format!(
                "backoff base {}ms exceeds the cap {}ms; every retry waits the cap",
                config.retry.backoff_base_ms, config.retry.backoff_max_ms
            ),
        );
    }
    if !(0.0..=1.0).contains(&config.retry.jitter_ratio) {
        warnings.push(
            "retry.jitter_ratio",
            format!(
                "jitter ratio {} is clamped to 0..=1",
                config.retry.jitter_ratio
            ),
        );
    }

    let scale = config.gain.ripple_scale;
    if !scale.is_finite() || scale <= 0.0 {
        issues.push(format!(
            "gain.ripple_scale must be finite and positive, got {scale}"
        ));
    }

    let ber = config.links.max_bit_error_rate;
    if !ber.is_finite() || !(0.0..=1.0).contains(&ber) {
        issues.push(format!(
            "links.max_bit_error_rate must lie in 0..=1, got {ber}"
        ));
    }

    for (command, uris) in &config.interfaces.allow_list {
        if uris.is_empty() {
            warnings.push(
                "interfaces.allow_list",
                format!("{command} accepts no interface and will always be rejected"),
            );
        }
    }

    check_inventory(config, &mut issues, &mut warnings);

    if issues.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigGuardRailError { issues })
    }
}

fn check_inventory(
    config: &ControllerConfig,
    issues: &mut Vec<String>,
    warnings: &mut ConfigWarnings,
) {
    let inventory = &config.inventory;
    if inventory.fsps.is_empty() {
        warnings.push(
            "inventory.fsps",
            "no processing units configured; every ConfigureScan will fail",
        );
    }

    let mut fsps = BTreeSet::new();
    for entry in &inventory.fsps {
        if !fsps.insert(entry.id) {
            issues.push(format!("inventory.fsps lists fsp {} twice", entry.id));
        }
    }

    let mut receptors = BTreeSet::new();
    let mut vccs = BTreeMap::new();
    for mapping in &inventory.receptors {
        if !receptors.insert(mapping.receptor.clone()) {
            issues.push(format!(
                "receptor {} maps to more than one vcc",
                mapping.receptor
            ));
        }
        if let Some(previous) =
            vccs.insert(mapping.vcc, mapping.receptor.clone())
            && previous != mapping.receptor
        {
            issues.push(format!(
                "vcc {} is shared by receptors {} and {}",
                mapping.vcc, previous, mapping.receptor
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use cbf_core::config::{FspInventoryEntry, ReceptorMapping};
    use cbf_model::{FspId, ReceptorId, VccId};

    use super::*;

    fn mapping(receptor: &str, vcc: u8) -> ReceptorMapping {
        ReceptorMapping {
            receptor: ReceptorId::parse(receptor).unwrap(),
            vcc: VccId::new(vcc).unwrap(),
        }
    }

    fn unit(id: u8) -> FspInventoryEntry {
        FspInventoryEntry {
            id: FspId::new(id).unwrap(),
            modes: Vec::new(),
        }
    }

    #[test]
    fn defaults_pass_with_an_inventory_warning() {
        let warnings = apply_guard_rails(&ControllerConfig::default()).unwrap();
        assert_eq!(warnings.fields(), vec!["inventory.fsps"]);
    }

    #[test]
    fn every_violation_is_reported() {
        let mut config = ControllerConfig::default();
        config.commands.queue_capacity = 0;
        config.remote.call_timeout_ms = 0;
        config.retry.max_attempts = 0;
        config.gain.ripple_scale = f64::NAN;

        let err = apply_guard_rails(&config).unwrap_err();
        assert_eq!(err.issues.len(), 4, "{err}");
        assert!(err.to_string().starts_with("configuration failed 4 guard rail(s)"));
    }

    #[test]
    fn ripple_scale_must_be_positive() {
        for scale in [0.0, -0.99, f64::INFINITY] {
            let mut config = ControllerConfig::default();
            config.gain.ripple_scale = scale;
            assert!(apply_guard_rails(&config).is_err(), "{scale}");
        }
        let mut config = ControllerConfig::default();
        config.gain.ripple_scale = 0.99;
        assert!(apply_guard_rails(&config).is_ok());
    }

    #[test]
    fn receptor_mapping_must_be_one_to_one() {
        let mut config = ControllerConfig::default();
        config.inventory.fsps = vec![unit(1), unit(2), unit(1)];
        config.inventory.receptors = vec![
            mapping("SKA001", 1),
            mapping("SKA002", 1),
            mapping("SKA001", 3),
        ];

        let err = apply_guard_rails(&config).unwrap_err();
        assert_eq!(err.issues.len(), 3, "{err}");
        assert!(err.issues.iter().any(|issue| issue.contains("fsp 1 twice")));
        assert!(err.issues.iter().any(|issue| issue.contains("shared by")));
        assert!(
            err.issues
                .iter()
                .any(|issue| issue.contains("more than one vcc"))
        );
    }

    #[test]
    fn soft_problems_only_warn() {
        let mut config = ControllerConfig::default();
        config.inventory.fsps = vec![unit(1)];
        config.commands.event_channel_capacity = 4;
        config.retry.jitter_ratio = 1.5;

        let warnings = apply_guard_rails(&config).unwrap();
        assert_eq!(
            warnings.fields(),
            vec!["commands.event_channel_capacity", "retry.jitter_ratio"]
        );
    }
}
