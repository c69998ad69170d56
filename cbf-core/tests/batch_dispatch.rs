mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use cbf_core::{
    BatchCall, BatchOutcome, CbfError, ComponentManager, ProxyCommand, ResourceProxy,
};
use cbf_model::{CommandStatus, CommunicationStatus, HealthState, ObsState, ResultCode};
use tokio_util::sync::CancellationToken;

use support::{
    Behavior, CallLog, Rig, ScriptedProxy, assign_document, corr_document, fast_config,
    finished, sub,
};

async fn manager_with(names: &[&str]) -> (ComponentManager, Vec<Arc<ScriptedProxy>>, CallLog) {
    let log = CallLog::default();
    let manager = ComponentManager::new("test", &fast_config());
    let mut proxies = Vec::new();
    for name in names {
        let proxy = ScriptedProxy::standalone(*name, log.clone());
        manager.add_link(Arc::clone(&proxy) as Arc<dyn ResourceProxy>).await;
        proxies.push(proxy);
    }
    assert_eq!(manager.start_communicating().await, CommunicationStatus::Established);
    (manager, proxies, log)
}

fn configure_all(names: &[&str]) -> Vec<BatchCall> {
    names
        .iter()
        .map(|name| BatchCall::new(*name, ProxyCommand::ConfigureScan(serde_json::json!({}))))
        .collect()
}

#[tokio::test]
async fn first_failure_stops_the_batch() -> Result<()> {
    let names = ["a", "b", "c"];
    let (manager, proxies, log) = manager_with(&names).await;
    let faults = Arc::new(Mutex::new(Vec::new()));
    let manager = manager.with_fault_callback({
        let faults = Arc::clone(&faults);
        Arc::new(move |resource: &str, _: &CbfError| {
            faults.lock().unwrap().push(resource.to_string());
        })
    });
    proxies[1].script("ConfigureScan", Behavior::Reply(ResultCode::Failed));

    let outcome = manager
        .issue_batch(configure_all(&names), &CancellationToken::new())
        .await;
    let BatchOutcome::Failed {
        acknowledged,
        resource,
        error,
    } = outcome
    else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(acknowledged, vec!["a".to_string()]);
    assert_eq!(resource, "b");
    assert!(!error.is_retryable());
    assert_eq!(log.entries(), vec!["a:ConfigureScan", "b:ConfigureScan"]);
    assert!(manager.is_faulted());
    assert_eq!(manager.health_state().await, HealthState::Failed);
    assert_eq!(*faults.lock().unwrap(), vec!["b".to_string()]);
    // an explicit rejection leaves the link up
    assert_eq!(manager.link_status("b").await, Some(CommunicationStatus::Established));
    assert!(manager.tracker().is_empty());
    Ok(())
}

#[tokio::test]
async fn transient_errors_are_retried_within_budget() -> Result<()> {
    let names = ["a"];
    let (manager, proxies, log) = manager_with(&names).await;
    proxies[0].script("ConfigureScan", Behavior::Transient(2));

    let outcome = manager
        .issue_batch(configure_all(&names), &CancellationToken::new())
        .await;
    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(log.entries().len(), 3);
    assert!(!manager.is_faulted());
    Ok(())
}

#[tokio::test]
async fn exhausted_timeouts_drop_the_link() -> Result<()> {
    let names = ["a", "b"];
    let (manager, proxies, log) = manager_with(&names).await;
    proxies[0].script("ConfigureScan", Behavior::Stall(Duration::from_millis(400)));

    let outcome = manager
        .issue_batch(configure_all(&names), &CancellationToken::new())
        .await;
    let error = outcome.into_result().unwrap_err();
    assert!(error.is_retryable(), "{error:?}");
    assert_eq!(log.entries(), vec!["a:ConfigureScan"; 3]);
    assert_eq!(manager.link_status("a").await, Some(CommunicationStatus::NotEstablished));
    assert_eq!(manager.communication_status().await, CommunicationStatus::NotEstablished);
    Ok(())
}

#[tokio::test]
async fn cancellation_is_honoured_at_the_next_checkpoint() -> Result<()> {
    let names = ["a", "b", "c"];
    let (manager, proxies, log) = manager_with(&names).await;
    let manager = Arc::new(manager);
    proxies[0].script("ConfigureScan", Behavior::Stall(Duration::from_millis(50)));

    let token = manager.cancellation();
    let batch = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.issue_batch(configure_all(&names), &token).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    manager.on_abort_requested();

    let outcome = batch.await?;
    let BatchOutcome::Aborted {
        acknowledged,
        skipped,
    } = outcome
    else {
        panic!("expected abort, got {outcome:?}");
    };
    // the call already under way ran to completion
    assert_eq!(acknowledged, vec!["a".to_string()]);
    assert_eq!(skipped, vec!["b".to_string(), "c".to_string()]);
    assert_eq!(log.entries(), vec!["a:ConfigureScan"]);
    assert!(!manager.is_faulted());

    manager.reset_cancellation();
    assert!(!manager.cancellation().is_cancelled());
    Ok(())
}

#[tokio::test]
async fn batches_larger_than_the_queue_are_refused() -> Result<()> {
    let mut config = fast_config();
    config.commands.queue_capacity = 2;
    let log = CallLog::default();
    let manager = ComponentManager::new("small", &config);
    for name in ["a", "b", "c"] {
        manager
            .add_link(ScriptedProxy::standalone(name, log.clone()) as Arc<dyn ResourceProxy>)
            .await;
    }
    manager.start_communicating().await;

    let outcome = manager
        .issue_batch(configure_all(&["a", "b", "c"]), &CancellationToken::new())
        .await;
    assert!(matches!(
        outcome,
        BatchOutcome::Failed {
            error: CbfError::QueueFull { capacity: 2 },
            ..
        }
    ));
    assert!(log.entries().is_empty());
    assert!(manager.tracker().is_empty());
    Ok(())
}

#[tokio::test]
async fn disabled_links_refuse_commands() -> Result<()> {
    let log = CallLog::default();
    let manager = ComponentManager::new("test", &fast_config());
    manager
        .add_link(ScriptedProxy::standalone("a", log.clone()) as Arc<dyn ResourceProxy>)
        .await;
    // no handshake yet
    let outcome = manager
        .issue_batch(configure_all(&["a"]), &CancellationToken::new())
        .await;
    assert!(matches!(
        outcome.into_result(),
        Err(CbfError::RemoteCommand { transient: false, .. })
    ));

    manager.stop_communicating().await;
    assert_eq!(manager.communication_status().await, CommunicationStatus::Disabled);
    Ok(())
}

#[tokio::test]
async fn remote_failure_faults_the_device_until_obs_reset() -> Result<()> {
    let rig = Rig::new(2, 2);
    let (device, proxies) = rig.device(sub(1)).await?;
    let mut events = device.subscribe_commands();

    let (_, id) = device.assign_resources(&assign_document(1, &[1, 2])).await?;
    finished(&mut events, &id).await?;

    proxies["fsp01"].script("ConfigureScan", Behavior::Reply(ResultCode::Rejected));
    let (_, id) = device.configure_scan(&corr_document("cfg")).await?;
    let event = finished(&mut events, &id).await?;
    assert_eq!(event.status, CommandStatus::Failed);
    assert_eq!(event.result.map(|r| r.code), Some(ResultCode::Failed));
    assert_eq!(device.obs_state(), ObsState::Fault);

    // fail-fast, and what was acknowledged stays put
    assert!(rig.log.contains("fsp01:AddMembership"));
    assert!(!rig.log.contains("fsp02:AddMembership"));
    assert_eq!(rig.unit(1).membership(), vec![sub(1)]);
    assert_eq!(rig.channelizers[0].obs_state(), ObsState::Ready);

    let state = device.resource_state().await;
    assert!(state.faulted);
    assert_eq!(state.obs_state, ObsState::Fault);
    assert_eq!(state.health, HealthState::Failed);

    let (_, id) = device.obs_reset().await?;
    let event = finished(&mut events, &id).await?;
    assert_eq!(event.status, CommandStatus::Completed, "{event:?}");
    assert_eq!(device.obs_state(), ObsState::Idle);
    assert!(!device.resource_state().await.faulted);
    assert!(rig.unit(1).membership().is_empty());
    assert_eq!(rig.channelizers[0].obs_state(), ObsState::Idle);
    assert!(rig.pool.snapshot().await.fsps_owned_by(sub(1)).is_empty());
    assert_eq!(device.receptors().await.len(), 2);

    device.shutdown().await;
    Ok(())
}
