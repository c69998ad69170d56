#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cbf_core::config::{FspInventoryEntry, InventoryConfig, ReceptorMapping};
use cbf_core::resources::channelizer::channelizer_resource_id;
use cbf_core::{
    CbfError, CommandEvent, CommandId, ComponentManager, ControllerConfig, LocalChannelizer,
    LocalProcessingUnit, ObservingDevice, ProxyCommand, RemoteReply,
    ResourcePool, ResourceProxy,
};
use cbf_model::{
    FspId, ObsState, ReceptorId, ResultCode, SubarrayId, VccId,
};
use tokio::sync::broadcast;

pub const INTERFACE_ROOT: &str = "https://schema.skao.int";

#[derive(Clone, Debug)]
pub enum Behavior {
    /// Reply with this result code instead of running the command.
    Reply(ResultCode),
    /// Fail at the transport level this many times, then behave normally.
    Transient(usize),
    /// Sleep before running the command.
    Stall(Duration),
}

/// Calls seen by every proxy built from the same log, as
/// `resource:Command`, in dispatch order.
#[derive(Clone, Debug, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries().iter().any(|e| e == entry)
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// A [`ResourceProxy`] whose behaviour can be scripted per command name.
///
/// Wraps an in-process unit when one is given; otherwise every command
/// succeeds and the reported state is IDLE.
pub struct ScriptedProxy {
    resource_id: String,
    inner: Option<Arc<dyn ResourceProxy>>,
    rules: Mutex<BTreeMap<String, Behavior>>,
    log: CallLog,
}

impl ScriptedProxy {
    pub fn standalone(resource_id: impl Into<String>, log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            resource_id: resource_id.into(),
            inner: None,
            rules: Mutex::new(BTreeMap::new()),
            log,
        })
    }

    pub fn wrapping(inner: Arc<dyn ResourceProxy>, log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            resource_id: inner.resource_id().to_string(),
            inner: Some(inner),
            rules: Mutex::new(BTreeMap::new()),
            log,
        })
    }

    pub fn script(&self, command: &str, behavior: Behavior) {
        self.rules
            .lock()
            .unwrap()
            .insert(command.to_string(), behavior);
    }

    pub fn clear_script(&self) {
        self.rules.lock().unwrap().clear();
    }

    /// Rule for `command`, consuming one transient failure if that is what
    /// is scripted.
    fn take_rule(&self, command: &str) -> Option<Behavior> {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules.get(command).cloned();
        if let Some(Behavior::Transient(left)) = rule {
            if left <= 1 {
                rules.remove(command);
            } else {
                rules.insert(command.to_string(), Behavior::Transient(left - 1));
            }
        }
        rule
    }
}

#[async_trait]
impl ResourceProxy for ScriptedProxy {
    fn resource_id(&self) -> &str {
        &self.resource_id
    }

    async fn state(&self) -> cbf_core::Result<ObsState> {
        match &self.inner {
            Some(inner) => inner.state().await,
            None => Ok(ObsState::Idle),
        }
    }

    async fn execute(&self, command: &ProxyCommand) -> cbf_core::Result<RemoteReply> {
        self.log
            .push(format!("{}:{}", self.resource_id, command.name()));
        match self.take_rule(command.name()) {
            Some(Behavior::Reply(code)) => {
                return Ok(RemoteReply::done(code, "scripted reply"));
            }
            Some(Behavior::Transient(_)) => {
                return Err(CbfError::RemoteCommand {
                    resource: self.resource_id.clone(),
                    command: command.name().to_string(),
                    reason: "connection reset".to_string(),
                    transient: true,
                });
            }
            Some(Behavior::Stall(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }
        match &self.inner {
            Some(inner) => inner.execute(command).await,
            None => Ok(RemoteReply::ok()),
        }
    }

    async fn wait_for_result(&self, command_id: &str) -> cbf_core::Result<RemoteReply> {
        match &self.inner {
            Some(inner) => inner.wait_for_result(command_id).await,
            None => Ok(RemoteReply::ok()),
        }
    }
}

/// Short timeouts and backoff so failure paths finish quickly.
pub fn fast_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.remote.call_timeout_ms = 100;
    config.remote.handshake_timeout_ms = 100;
    config.retry.backoff_base_ms = 5;
    config.retry.backoff_max_ms = 20;
    config.retry.jitter_ratio = 0.0;
    config
}

pub fn sub(id: u8) -> SubarrayId {
    SubarrayId::new(id).unwrap()
}

pub fn fsp(id: u8) -> FspId {
    FspId::new(id).unwrap()
}

pub fn receptor(n: u16) -> ReceptorId {
    ReceptorId::parse(&format!("SKA{n:03}")).unwrap()
}

/// Inventory with `fsps` universal units and receptors SKA001.. mapped to
/// VCC 1..
pub fn inventory(fsps: u8, receptors: u16) -> InventoryConfig {
    InventoryConfig {
        fsps: (1..=fsps)
            .map(|id| FspInventoryEntry {
                id: fsp(id),
                modes: Vec::new(),
            })
            .collect(),
        receptors: (1..=receptors)
            .map(|n| ReceptorMapping {
                receptor: receptor(n),
                vcc: VccId::new(n as u8).unwrap(),
            })
            .collect(),
    }
}

/// In-process units behind scripted proxies, plus the shared pool.
pub struct Rig {
    pub config: ControllerConfig,
    pub pool: Arc<ResourcePool>,
    pub units: Vec<Arc<LocalProcessingUnit>>,
    pub channelizers: Vec<Arc<LocalChannelizer>>,
    pub log: CallLog,
}

impl Rig {
    pub fn new(fsps: u8, receptors: u16) -> Self {
        let mut config = fast_config();
        config.inventory = inventory(fsps, receptors);
        let pool = Arc::new(ResourcePool::from_inventory(&config.inventory).unwrap());
        let units = config
            .inventory
            .fsps
            .iter()
            .map(|entry| LocalProcessingUnit::new(entry.id, &entry.modes))
            .collect();
        let channelizers = config
            .inventory
            .receptors
            .iter()
            .map(|mapping| Arc::new(LocalChannelizer::new(mapping.vcc)))
            .collect();
        Self {
            config,
            pool,
            units,
            channelizers,
            log: CallLog::default(),
        }
    }

    /// Scripted proxies for every unit, as seen from `subarray`.
    pub fn proxies(&self, subarray: SubarrayId) -> Vec<Arc<ScriptedProxy>> {
        let units = self.units.iter().map(|unit| {
            ScriptedProxy::wrapping(Arc::new(unit.for_subarray(subarray)), self.log.clone())
        });
        let channelizers = self.channelizers.iter().map(|vcc| {
            ScriptedProxy::wrapping(
                Arc::clone(vcc) as Arc<dyn ResourceProxy>,
                self.log.clone(),
            )
        });
        units.chain(channelizers).collect()
    }

    /// A communicating device for `subarray` and the proxies it talks to.
    pub async fn device(
        &self,
        subarray: SubarrayId,
    ) -> Result<(ObservingDevice, BTreeMap<String, Arc<ScriptedProxy>>)> {
        let manager = ComponentManager::new(format!("subarray{:02}", subarray.get()), &self.config);
        let mut proxies = BTreeMap::new();
        for proxy in self.proxies(subarray) {
            manager.add_link(Arc::clone(&proxy) as Arc<dyn ResourceProxy>).await;
            proxies.insert(proxy.resource_id().to_string(), proxy);
        }
        let device = ObservingDevice::spawn(
            subarray,
            self.config.clone(),
            Arc::clone(&self.pool),
            manager,
        );
        device.start_communicating().await;
        Ok((device, proxies))
    }

    pub fn unit(&self, id: u8) -> &Arc<LocalProcessingUnit> {
        &self.units[usize::from(id) - 1]
    }

    pub fn channelizer_id(&self, n: u8) -> String {
        channelizer_resource_id(VccId::new(n).unwrap())
    }
}

pub fn assign_document(subarray: u8, receptors: &[u16]) -> String {
    let ids: Vec<String> = receptors.iter().map(|n| format!("SKA{n:03}")).collect();
    serde_json::json!({
        "interface": format!("{INTERFACE_ROOT}/ska-csp-assignresources/2.3"),
        "subarray_id": subarray,
        "receptor_ids": ids,
    })
    .to_string()
}

/// A CORR configuration that needs two processing units.
pub fn corr_document(config_id: &str) -> String {
    serde_json::json!({
        "interface": format!("{INTERFACE_ROOT}/ska-csp-configurescan/4.1"),
        "config_id": config_id,
        "function_mode": "CORR",
        "frequency_band": "1",
        "start_freq": 350_000_000_i64,
        "channel_width": 13_440,
        "channel_count": 20_000,
        "k_offset": 0,
        "wideband_shift": 0,
        "fsp_ids": [1, 2],
        "output_link_map": [[0, 1], [14_880, 2]],
        "output_host": [[0, "192.168.0.1"]],
        "output_port": [[0, 9000]],
    })
    .to_string()
}

pub fn scan_document(scan_id: u64) -> String {
    serde_json::json!({
        "interface": format!("{INTERFACE_ROOT}/ska-csp-scan/2.3"),
        "scan_id": scan_id,
    })
    .to_string()
}

pub async fn wait_for(device: &ObservingDevice, state: ObsState) -> Result<()> {
    device
        .wait_for_obs_state(state, Duration::from_secs(5))
        .await
        .with_context(|| format!("waiting for {state}"))
}

/// Next terminal event for `id`. Subscribe before submitting.
pub async fn finished(
    events: &mut broadcast::Receiver<CommandEvent>,
    id: &CommandId,
) -> Result<CommandEvent> {
    let wait = async {
        loop {
            let event = events.recv().await?;
            if &event.id == id && event.status.is_terminal() {
                return Ok::<_, anyhow::Error>(event);
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .with_context(|| format!("command {id} did not finish"))?
}
