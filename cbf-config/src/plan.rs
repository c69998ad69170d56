//! Offline dry runs of interface validation and spectrum partitioning.

use std::sync::Arc;

use cbf_core::assignment::FspConfiguration;
use cbf_core::spectrum::FrequencySlice;
use cbf_core::{
    AssignmentBuilder, CbfError, ControllerConfig, InterfaceValidator,
    ResourcePool, ScanRequest, SpectrumPartitioner,
};
use cbf_model::{ProcessingMode, SubarrayId};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationVerdict {
    pub command: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    pub accepted_interfaces: Vec<String>,
}

/// Check `document` against the allow-list `config` would run with.
pub fn validate_document(
    config: &ControllerConfig,
    document: &str,
    command: &str,
) -> ValidationVerdict {
    let validator = InterfaceValidator::from_config(&config.interfaces);
    let (accepted, reason) = validator.validate(document, command);
    ValidationVerdict {
        command: command.to_ascii_lowercase(),
        accepted,
        reason,
        accepted_interfaces: validator.accepted_versions(command).to_vec(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedUnit {
    pub slice: FrequencySlice,
    /// Full `ConfigureScan` payload; absent for a bare partition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<FspConfiguration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionPlan {
    pub subarray_id: SubarrayId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ProcessingMode>,
    pub total_channels: u32,
    pub units: Vec<PlannedUnit>,
}

/// Work out which processing units a scan configuration would get.
///
/// With an inventory and a `function_mode`, the plan runs the full
/// assignment builder against a fresh pool, including automatic FSP
/// selection and per-unit payloads. Otherwise the document must name its
/// `fsp_ids` and only the channel split is computed. Nothing is claimed.
pub async fn plan_partition(
    config: &ControllerConfig,
    document: &str,
    subarray: SubarrayId,
) -> cbf_core::Result<PartitionPlan> {
    let value: Value = serde_json::from_str(document)?;
    let request = ScanRequest::from_document(&value)?;
    let partitioner = SpectrumPartitioner::new(config.spectrum.k_offset_step_hz);

    match request.processing_mode {
        Some(mode) if !config.inventory.fsps.is_empty() => {
            let pool = Arc::new(ResourcePool::from_inventory(&config.inventory)?);
            let mut builder = AssignmentBuilder::new(pool, partitioner, subarray);
            builder.set_mode(mode).set_config(value);
            let prepared = builder.prepare().await?;
            let assignment = prepared.assignment();
            debug!(
                subarray = %subarray,
                mode = %mode,
                fsp_count = assignment.units.len(),
                "assignment planned"
            );
            Ok(PartitionPlan {
                subarray_id: subarray,
                mode: Some(mode),
                total_channels: assignment.total_channels(),
                units: assignment
                    .units
                    .values()
                    .map(|unit| PlannedUnit {
                        slice: unit.slice.clone(),
                        configuration: Some(unit.configuration.clone()),
                    })
                    .collect(),
            })
        }
        mode => {
            let fsp_ids = request.fsp_ids.clone().ok_or_else(|| {
                CbfError::Validation(
                    "fsp_ids is required without an inventory and function_mode"
                        .to_string(),
                )
            })?;
            let slices =
                partitioner.partition(&request.partition_request(fsp_ids))?;
            Ok(PartitionPlan {
                subarray_id: subarray,
                mode,
                total_channels: slices.iter().map(FrequencySlice::channel_count).sum(),
                units: slices
                    .into_iter()
                    .map(|slice| PlannedUnit {
                        slice,
                        configuration: None,
                    })
                    .collect(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sub(id: u8) -> SubarrayId {
        SubarrayId::new(id).unwrap()
    }

    #[test]
    fn verdict_lists_the_accepted_interfaces() {
        let config = ControllerConfig::default();
        let verdict = validate_document(
            &config,
            r#"{"interface": "https://schema.skao.int/ska-csp-scan/2.3"}"#,
            "Scan",
        );
        assert!(verdict.accepted, "{verdict:?}");
        assert_eq!(verdict.command, "scan");
        assert!(!verdict.accepted_interfaces.is_empty());

        let verdict = validate_document(&config, "{}", "scan");
        assert!(!verdict.accepted);
        assert_eq!(verdict.reason, "missing required interface parameter");
    }

    #[tokio::test]
    async fn bare_partition_needs_fsp_ids() {
        let config = ControllerConfig::default();
        let document = json!({
            "start_freq": 350_000_000,
            "channel_width": 13_440,
            "channel_count": 100,
            "k_offset": 0,
            "wideband_shift": 0,
        });

        let err = plan_partition(&config, &document.to_string(), sub(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CbfError::Validation(_)), "{err:?}");

        let mut with_ids = document;
        with_ids["fsp_ids"] = json!([3, 1]);
        let plan = plan_partition(&config, &with_ids.to_string(), sub(1))
            .await
            .unwrap();
        assert_eq!(plan.total_channels, 100);
        let order: Vec<u8> =
            plan.units.iter().map(|unit| unit.slice.fsp_id.get()).collect();
        assert_eq!(order, vec![3, 1]);
        assert!(plan.units.iter().all(|unit| unit.configuration.is_none()));
    }
}
