use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use cbf_model::{FspId, ProcessingMode, ReceptorId, SubarrayId, VccId};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::InventoryConfig;
use crate::error::{CbfError, Result};

/// Capability and ownership record for one processing unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FspRecord {
    pub capabilities: BTreeSet<ProcessingMode>,
    pub owner: Option<SubarrayId>,
}

impl FspRecord {
    pub fn supports(&self, mode: ProcessingMode) -> bool {
        self.capabilities.contains(&mode)
    }
}

/// Immutable view of the pool at one version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub version: u64,
    fsps: BTreeMap<FspId, FspRecord>,
    receptors: BTreeMap<ReceptorId, VccId>,
    vcc_owners: BTreeMap<VccId, Option<SubarrayId>>,
}

impl PoolSnapshot {
    pub fn fsp(&self, id: FspId) -> Option<&FspRecord> {
        self.fsps.get(&id)
    }

    pub fn fsp_ids(&self) -> impl Iterator<Item = FspId> + '_ {
        self.fsps.keys().copied()
    }

    /// Units able to run `mode` that are free or already held by `subarray`,
    /// lowest id first.
    pub fn available_fsps(
        &self,
        mode: ProcessingMode,
        subarray: SubarrayId,
    ) -> Vec<FspId> {
        self.fsps
            .iter()
            .filter(|(_, record)| record.supports(mode))
            .filter(|(_, record)| record.owner.is_none_or(|o| o == subarray))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn fsps_owned_by(&self, subarray: SubarrayId) -> Vec<FspId> {
        self.fsps
            .iter()
            .filter(|(_, record)| record.owner == Some(subarray))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn vcc_for(&self, receptor: &ReceptorId) -> Option<VccId> {
        self.receptors.get(receptor).copied()
    }

    pub fn vcc_owner(&self, vcc: VccId) -> Option<SubarrayId> {
        self.vcc_owners.get(&vcc).copied().flatten()
    }

    pub fn vccs_owned_by(&self, subarray: SubarrayId) -> Vec<VccId> {
        self.vcc_owners
            .iter()
            .filter(|(_, owner)| **owner == Some(subarray))
            .map(|(vcc, _)| *vcc)
            .collect()
    }

    /// Receptors whose channelizer is held by `subarray`.
    pub fn receptors_owned_by(&self, subarray: SubarrayId) -> Vec<ReceptorId> {
        self.receptors
            .iter()
            .filter(|(_, vcc)| self.vcc_owner(**vcc) == Some(subarray))
            .map(|(receptor, _)| receptor.clone())
            .collect()
    }
}

/// Ownership changes applied atomically by [`ResourcePool::commit`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolChange {
    pub claim_fsps: Vec<FspId>,
    pub release_fsps: Vec<FspId>,
    pub claim_vccs: Vec<VccId>,
    pub release_vccs: Vec<VccId>,
}

impl PoolChange {
    pub fn claim_fsps(ids: impl IntoIterator<Item = FspId>) -> Self {
        Self {
            claim_fsps: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn release_fsps(ids: impl IntoIterator<Item = FspId>) -> Self {
        Self {
            release_fsps: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn claim_vccs(ids: impl IntoIterator<Item = VccId>) -> Self {
        Self {
            claim_vccs: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn release_vccs(ids: impl IntoIterator<Item = VccId>) -> Self {
        Self {
            release_vccs: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.claim_fsps.is_empty()
            && self.release_fsps.is_empty()
            && self.claim_vccs.is_empty()
            && self.release_vccs.is_empty()
    }
}

/// Process-wide registry of processing units and channelizers.
///
/// The only state shared between orchestrators. Writes are optimistic: a
/// caller reads a [`PoolSnapshot`], computes its change, and commits it
/// against the snapshot's version. No lock is held across remote calls.
pub struct ResourcePool {
    state: RwLock<PoolSnapshot>,
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ResourcePool");
        match self.state.try_read() {
            Ok(state) => {
                debug
                    .field("version", &state.version)
                    .field("fsp_count", &state.fsps.len())
                    .field("receptor_count", &state.receptors.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl ResourcePool {
    pub fn from_inventory(inventory: &InventoryConfig) -> Result<Self> {
        let mut snapshot = PoolSnapshot::default();

        for entry in &inventory.fsps {
            let capabilities: BTreeSet<ProcessingMode> = if entry.modes.is_empty()
            {
                ProcessingMode::all().iter().copied().collect()
            } else {
                entry.modes.iter().copied().collect()
            };
            let record = FspRecord {
                capabilities,
                owner: None,
            };
            if snapshot.fsps.insert(entry.id, record).is_some() {
                return Err(CbfError::Validation(format!(
                    "fsp {} listed twice in inventory",
                    entry.id
                )));
            }
        }

        for mapping in &inventory.receptors {
            if snapshot.vcc_owners.insert(mapping.vcc, None).is_some() {
                return Err(CbfError::Validation(format!(
                    "vcc {} mapped to more than one receptor",
                    mapping.vcc
                )));
            }
            if snapshot
                .receptors
                .insert(mapping.receptor.clone(), mapping.vcc)
                .is_some()
            {
                return Err(CbfError::Validation(format!(
                    "receptor {} mapped to more than one vcc",
                    mapping.receptor
                )));
            }
        }

        Ok(Self {
            state: RwLock::new(snapshot),
        })
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        self.state.read().await.clone()
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    /// Apply `change` on behalf of `subarray` if the pool is still at
    /// `expected_version`. Either every entry applies or none does.
    pub async fn commit(
        &self,
        expected_version: u64,
        subarray: SubarrayId,
        change: &PoolChange,
    ) -> Result<u64> {
        let mut state = self.state.write().await;
        if state.version != expected_version {
            debug!(
                subarray = %subarray,
                expected_version,
                current_version = state.version,
                "pool version moved; rejecting write"
            );
            return Err(CbfError::ResourceConflict(format!(
                "resource pool changed (expected version {expected_version}, \
                 found {})",
                state.version
            )));
        }

        for id in change.claim_fsps.iter().chain(&change.release_fsps) {
            let record = state.fsps.get(id).ok_or_else(|| {
                CbfError::NotFound(format!("fsp {id} is not in the pool"))
            })?;
            if let Some(owner) = record.owner
                && owner != subarray
            {
                return Err(CbfError::ResourceConflict(format!(
                    "fsp {id} is owned by subarray {owner}"
                )));
            }
        }
        for vcc in change.claim_vccs.iter().chain(&change.release_vccs) {
            let owner = state.vcc_owners.get(vcc).ok_or_else(|| {
                CbfError::NotFound(format!("vcc {vcc} is not in the pool"))
            })?;
            if let Some(owner) = owner
                && *owner != subarray
            {
                return Err(CbfError::ResourceConflict(format!(
                    "vcc {vcc} is owned by subarray {owner}"
                )));
            }
        }

        for id in &change.release_fsps {
            if let Some(record) = state.fsps.get_mut(id) {
                record.owner = None;
            }
        }
        for id in &change.claim_fsps {
            if let Some(record) = state.fsps.get_mut(id) {
                record.owner = Some(subarray);
            }
        }
        for vcc in &change.release_vccs {
            state.vcc_owners.insert(*vcc, None);
        }
        for vcc in &change.claim_vccs {
            state.vcc_owners.insert(*vcc, Some(subarray));
        }

        state.version += 1;
        info!(
            subarray = %subarray,
            version = state.version,
            claimed_fsps = change.claim_fsps.len(),
            released_fsps = change.release_fsps.len(),
            claimed_vccs = change.claim_vccs.len(),
            released_vccs = change.release_vccs.len(),
            "resource pool updated"
        );
        Ok(state.version)
    }

    /// Re-read and retry a change computed from fresh snapshots until it
    /// lands. Only for changes that are recomputed on every attempt, such as
    /// returning everything a subarray holds.
    pub async fn commit_with<F>(
        &self,
        subarray: SubarrayId,
        max_attempts: u16,
        mut compute: F,
    ) -> Result<u64>
    where
        F: FnMut(&PoolSnapshot) -> PoolChange,
    {
        let mut last_err = None;
        for _ in 0..max_attempts.max(1) {
            let snapshot = self.snapshot().await;
            let change = compute(&snapshot);
            if change.is_empty() {
                return Ok(snapshot.version);
            }
            match self.commit(snapshot.version, subarray, &change).await {
                Ok(version) => return Ok(version),
                Err(err @ CbfError::ResourceConflict(_)) => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            CbfError::Internal("commit attempts exhausted".to_string())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FspInventoryEntry, ReceptorMapping};

    fn sub(id: u8) -> SubarrayId {
        SubarrayId::new(id).unwrap()
    }

    fn fsp(id: u8) -> FspId {
        FspId::new(id).unwrap()
    }

    fn inventory() -> InventoryConfig {
        InventoryConfig {
            fsps: vec![
                FspInventoryEntry {
                    id: fsp(1),
                    modes: vec![],
                },
                FspInventoryEntry {
                    id: fsp(2),
                    modes: vec![ProcessingMode::Corr],
                },
                FspInventoryEntry {
                    id: fsp(3),
                    modes: vec![ProcessingMode::Pst],
                },
            ],
            receptors: vec![ReceptorMapping {
                receptor: ReceptorId::parse("SKA001").unwrap(),
                vcc: VccId::new(1).unwrap(),
            }],
        }
    }

    #[tokio::test]
    async fn stale_version_is_rejected_without_mutation() {
        let pool = ResourcePool::from_inventory(&inventory()).unwrap();
        let stale = pool.snapshot().await;

        pool.commit(stale.version, sub(1), &PoolChange::claim_fsps([fsp(1)]))
            .await
            .unwrap();
        let before = pool.snapshot().await;

        let err = pool
            .commit(stale.version, sub(2), &PoolChange::claim_fsps([fsp(2)]))
            .await
            .unwrap_err();
        assert!(matches!(err, CbfError::ResourceConflict(_)));
        assert_eq!(pool.snapshot().await, before);
    }

    #[tokio::test]
    async fn units_have_at_most_one_owner() {
        let pool = ResourcePool::from_inventory(&inventory()).unwrap();
        let v = pool.version().await;
        let v = pool
            .commit(v, sub(1), &PoolChange::claim_fsps([fsp(1)]))
            .await
            .unwrap();

        let err = pool
            .commit(v, sub(2), &PoolChange::claim_fsps([fsp(2), fsp(1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, CbfError::ResourceConflict(_)));

        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.fsp(fsp(2)).unwrap().owner, None);
        assert_eq!(snapshot.fsps_owned_by(sub(1)), vec![fsp(1)]);
    }

    #[tokio::test]
    async fn availability_respects_capabilities_and_owner() {
        let pool = ResourcePool::from_inventory(&inventory()).unwrap();
        let snapshot = pool.snapshot().await;
        assert_eq!(
            snapshot.available_fsps(ProcessingMode::Corr, sub(1)),
            vec![fsp(1), fsp(2)]
        );
        assert_eq!(
            snapshot.available_fsps(ProcessingMode::Pst, sub(1)),
            vec![fsp(1), fsp(3)]
        );

        pool.commit(snapshot.version, sub(2), &PoolChange::claim_fsps([fsp(1)]))
            .await
            .unwrap();
        let snapshot = pool.snapshot().await;
        assert_eq!(
            snapshot.available_fsps(ProcessingMode::Corr, sub(1)),
            vec![fsp(2)]
        );
        assert_eq!(
            snapshot.available_fsps(ProcessingMode::Corr, sub(2)),
            vec![fsp(1), fsp(2)]
        );
    }

    #[tokio::test]
    async fn duplicate_vcc_mapping_is_rejected() {
        let mut inv = inventory();
        inv.receptors.push(ReceptorMapping {
            receptor: ReceptorId::parse("SKA002").unwrap(),
            vcc: VccId::new(1).unwrap(),
        });
        assert!(ResourcePool::from_inventory(&inv).is_err());
    }

    #[tokio::test]
    async fn commit_with_recomputes_after_conflict() {
        let pool = ResourcePool::from_inventory(&inventory()).unwrap();
        let v = pool.version().await;
        pool.commit(v, sub(1), &PoolChange::claim_fsps([fsp(1), fsp(2)]))
            .await
            .unwrap();

        let version = pool
            .commit_with(sub(1), 3, |snapshot| {
                PoolChange::release_fsps(snapshot.fsps_owned_by(sub(1)))
            })
            .await
            .unwrap();
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.version, version);
        assert!(snapshot.fsps_owned_by(sub(1)).is_empty());
    }
}
