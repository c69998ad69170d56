use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use cbf_model::{
    FrequencyBand, FspId, ProcessingMode, ReceptorId, SubarrayId, VccId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::assignment::modes::{self, ModePayload};
use crate::assignment::pool::{PoolChange, PoolSnapshot, ResourcePool};
use crate::assignment::request::ScanRequest;
use crate::error::{CbfError, Result};
use crate::spectrum::{FS_BW_HZ, FrequencySlice, SpectrumPartitioner};

/// Configuration payload for one processing unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FspConfiguration {
    pub fsp_id: FspId,
    pub subarray_id: SubarrayId,
    pub config_id: String,
    pub frequency_band: FrequencyBand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub band_5_tuning: Option<Vec<f64>>,
    pub frequency_slice_id: u32,
    pub channel_offset: u32,
    pub channel_count: u32,
    pub start_freq_hz: i64,
    pub end_freq_hz: i64,
    pub vcc_ids: Vec<VccId>,
    pub receptor_ids: Vec<ReceptorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_model_subscription_point: Option<String>,
    #[serde(flatten)]
    pub mode: ModePayload,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnitAssignment {
    pub slice: FrequencySlice,
    pub vcc_ids: Vec<VccId>,
    pub channel_offset: u32,
    pub configuration: FspConfiguration,
}

impl UnitAssignment {
    /// Document sent to the unit's `ConfigureScan`.
    pub fn payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.configuration)?)
    }
}

/// Processing units allocated to one subarray for one scan configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct Assignment {
    pub subarray_id: SubarrayId,
    pub config_id: String,
    pub mode: ProcessingMode,
    /// Pool version produced by registering this assignment.
    pub pool_version: u64,
    pub units: BTreeMap<FspId, UnitAssignment>,
}

impl Assignment {
    pub fn fsp_ids(&self) -> Vec<FspId> {
        self.units.keys().copied().collect()
    }

    pub fn vcc_ids(&self) -> Vec<VccId> {
        self.units
            .values()
            .next()
            .map(|unit| unit.vcc_ids.clone())
            .unwrap_or_default()
    }

    pub fn frequency_slice_id(&self, fsp: FspId) -> Option<u32> {
        self.units.get(&fsp).map(|unit| unit.slice.id)
    }

    pub fn output_link_map(&self, fsp: FspId) -> Option<&[(u32, u32)]> {
        self.units
            .get(&fsp)
            .and_then(|unit| unit.configuration.mode.output_link_map())
    }

    pub fn total_channels(&self) -> u32 {
        self.units.values().map(|unit| unit.slice.channel_count()).sum()
    }
}

/// An assignment computed against one pool version, not yet registered.
#[derive(Clone, Debug)]
pub struct PreparedAssignment {
    expected_version: u64,
    assignment: Assignment,
}

impl PreparedAssignment {
    pub fn expected_version(&self) -> u64 {
        self.expected_version
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    /// Claim the units. Fails with `ResourceConflict`, writing nothing, if
    /// the pool moved since the assignment was computed.
    pub async fn commit(self, pool: &ResourcePool) -> Result<Assignment> {
        let Self {
            expected_version,
            mut assignment,
        } = self;
        let change = PoolChange::claim_fsps(assignment.fsp_ids());
        assignment.pool_version = pool
            .commit(expected_version, assignment.subarray_id, &change)
            .await?;
        info!(
            subarray = %assignment.subarray_id,
            config_id = %assignment.config_id,
            mode = %assignment.mode,
            fsp_count = assignment.units.len(),
            "assignment registered"
        );
        Ok(assignment)
    }
}

/// Turns a scan configuration into per-unit payloads.
///
/// `set_mode` and `set_config` may be called in any order before `build`.
pub struct AssignmentBuilder {
    pool: Arc<ResourcePool>,
    partitioner: SpectrumPartitioner,
    subarray: SubarrayId,
    mode: Option<ProcessingMode>,
    config: Option<Value>,
}

impl fmt::Debug for AssignmentBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssignmentBuilder")
            .field("subarray", &self.subarray)
            .field("mode", &self.mode)
            .field("has_config", &self.config.is_some())
            .finish()
    }
}

impl AssignmentBuilder {
    pub fn new(
        pool: Arc<ResourcePool>,
        partitioner: SpectrumPartitioner,
        subarray: SubarrayId,
    ) -> Self {
        Self {
            pool,
            partitioner,
            subarray,
            mode: None,
            config: None,
        }
    }

    pub fn set_mode(&mut self, mode: ProcessingMode) -> &mut Self {
        self.mode = Some(mode);
        self
    }

    pub fn set_config(&mut self, config: Value) -> &mut Self {
        self.config = Some(config);
        self
    }

    /// Compute and register the assignment.
    pub async fn build(&self) -> Result<Assignment> {
        self.prepare().await?.commit(&self.pool).await
    }

    /// Compute the assignment against the current pool snapshot without
    /// claiming anything.
    pub async fn prepare(&self) -> Result<PreparedAssignment> {
        let mode = self.mode.ok_or_else(|| {
            CbfError::Validation("processing mode not set".to_string())
        })?;
        let document = self.config.as_ref().ok_or_else(|| {
            CbfError::Validation("scan configuration not set".to_string())
        })?;
        let fields = document.as_object().ok_or_else(|| {
            CbfError::Validation(
                "scan configuration must be a JSON object".to_string(),
            )
        })?;

        let strategy = modes::strategy_for(mode)?;
        let missing: Vec<&str> = strategy
            .required_keys
            .iter()
            .copied()
            .filter(|key| !fields.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(CbfError::Validation(format!(
                "{mode} configuration is missing {}",
                missing.join(", ")
            )));
        }

        let request = ScanRequest::from_document(document)?;
        if let Some(declared) = request.processing_mode
            && declared != mode
        {
            return Err(CbfError::Validation(format!(
                "document function_mode {declared} does not match {mode}"
            )));
        }
        let band = request.frequency_band()?;
        if band.requires_stream_tuning() && request.band_5_tuning.is_none() {
            return Err(CbfError::Validation(format!(
                "band {} requires band_5_tuning",
                band.as_str()
            )));
        }
        if request.receptor_ids.is_empty() {
            return Err(CbfError::Validation(
                "receptor_ids must not be empty".to_string(),
            ));
        }
        let mode_payload = (strategy.parse)(fields, &request)?;

        let snapshot = self.pool.snapshot().await;
        let vcc_ids = self.resolve_vccs(&snapshot, &request)?;
        let fsp_ids = match &request.fsp_ids {
            Some(ids) => ids.clone(),
            None => self.select_fsps(&snapshot, mode, &request)?,
        };
        let slices = self
            .partitioner
            .partition(&request.partition_request(fsp_ids))?;

        let mut units = BTreeMap::new();
        for slice in slices {
            self.check_unit(&snapshot, slice.fsp_id, mode)?;
            let configuration = FspConfiguration {
                fsp_id: slice.fsp_id,
                subarray_id: self.subarray,
                config_id: request.config_id.clone(),
                frequency_band: band,
                band_5_tuning: request.band_5_tuning.clone(),
                frequency_slice_id: slice.id,
                channel_offset: slice.start_channel,
                channel_count: slice.channel_count(),
                start_freq_hz: slice.start_freq_hz,
                end_freq_hz: slice.end_freq_hz,
                vcc_ids: vcc_ids.clone(),
                receptor_ids: request.receptor_ids.iter().cloned().collect(),
                delay_model_subscription_point: request
                    .delay_model_subscription_point
                    .clone(),
                mode: mode_payload.for_slice(&slice),
            };
            debug!(
                subarray = %self.subarray,
                fsp = %slice.fsp_id,
                start_channel = slice.start_channel,
                channel_count = slice.channel_count(),
                frequency_slice_id = slice.id,
                "unit payload built"
            );
            units.insert(
                slice.fsp_id,
                UnitAssignment {
                    channel_offset: slice.start_channel,
                    vcc_ids: vcc_ids.clone(),
                    slice,
                    configuration,
                },
            );
        }

        Ok(PreparedAssignment {
            expected_version: snapshot.version,
            assignment: Assignment {
                subarray_id: self.subarray,
                config_id: request.config_id,
                mode,
                pool_version: snapshot.version,
                units,
            },
        })
    }

    fn resolve_vccs(
        &self,
        snapshot: &PoolSnapshot,
        request: &ScanRequest,
    ) -> Result<Vec<VccId>> {
        let mut vccs = Vec::with_capacity(request.receptor_ids.len());
        for receptor in &request.receptor_ids {
            let vcc = snapshot.vcc_for(receptor).ok_or_else(|| {
                CbfError::Validation(format!(
                    "receptor {receptor} has no channelizer in the pool"
                ))
            })?;
            if let Some(owner) = snapshot.vcc_owner(vcc)
                && owner != self.subarray
            {
                return Err(CbfError::ResourceConflict(format!(
                    "receptor {receptor} belongs to subarray {owner}"
                )));
            }
            vccs.push(vcc);
        }
        vccs.sort();
        Ok(vccs)
    }

    /// Lowest-numbered free units able to run `mode`, enough to cover the
    /// requested bandwidth.
    fn select_fsps(
        &self,
        snapshot: &PoolSnapshot,
        mode: ProcessingMode,
        request: &ScanRequest,
    ) -> Result<Vec<i64>> {
        let needed = match (request.bandwidth_hz(), request.channel_count) {
            (Some(bandwidth), Some(count)) if bandwidth > 0 && count > 0 => {
                let slices = bandwidth / FS_BW_HZ + i64::from(bandwidth % FS_BW_HZ != 0);
                usize::try_from(slices.min(count)).unwrap_or(usize::MAX)
            }
            _ => 1,
        };
        let available = snapshot.available_fsps(mode, self.subarray);
        if available.len() < needed {
            return Err(CbfError::ResourceConflict(format!(
                "{needed} {mode} unit(s) needed, {} free",
                available.len()
            )));
        }
        Ok(available
            .into_iter()
            .take(needed)
            .map(i64::from)
            .collect())
    }

    fn check_unit(
        &self,
        snapshot: &PoolSnapshot,
        fsp: FspId,
        mode: ProcessingMode,
    ) -> Result<()> {
        let record = snapshot.fsp(fsp).ok_or_else(|| {
            CbfError::Validation(format!("fsp {fsp} is not in the pool"))
        })?;
        if !record.supports(mode) {
            return Err(CbfError::Validation(format!(
                "fsp {fsp} cannot run {mode}"
            )));
        }
        match record.owner {
            Some(owner) if owner != self.subarray => {
                Err(CbfError::ResourceConflict(format!(
                    "fsp {fsp} is owned by subarray {owner}"
                )))
            }
            _ => Ok(()),
        }
    }
}
