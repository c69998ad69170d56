mod support;

use std::sync::Arc;

use anyhow::Result;
use cbf_core::assignment::PoolChange;
use cbf_core::{AssignmentBuilder, CbfError, SpectrumPartitioner};
use cbf_model::{CommandStatus, ProcessingMode};
use serde_json::json;

use support::{Rig, assign_document, corr_document, finished, receptor, sub};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn devices_share_the_pool_without_double_allocation() -> Result<()> {
    let rig = Rig::new(2, 4);
    let (first, _) = rig.device(sub(1)).await?;
    let (second, _) = rig.device(sub(2)).await?;
    let mut first_events = first.subscribe_commands();
    let mut second_events = second.subscribe_commands();

    let first_doc = assign_document(1, &[1, 2]);
    let second_doc = assign_document(2, &[3, 4]);
    let (a, b) = tokio::join!(
        first.assign_resources(&first_doc),
        second.assign_resources(&second_doc),
    );
    finished(&mut first_events, &a?.1).await?;
    finished(&mut second_events, &b?.1).await?;

    // a receptor already held elsewhere is a conflict, not a validation error
    assert!(matches!(
        second.assign_resources(&assign_document(2, &[1])).await,
        Err(CbfError::ResourceConflict(_))
    ));

    // both want fsp01 and fsp02; exactly one may have them
    let first_doc = corr_document("first");
    let second_doc = corr_document("second");
    let (a, b) = tokio::join!(
        first.configure_scan(&first_doc),
        second.configure_scan(&second_doc),
    );
    let (winner, mut events) = match (a, b) {
        (Ok((_, id)), Err(CbfError::ResourceConflict(_))) => (id, first_events),
        (Err(CbfError::ResourceConflict(_)), Ok((_, id))) => (id, second_events),
        other => panic!("expected exactly one conflict, got {other:?}"),
    };
    assert_eq!(finished(&mut events, &winner).await?.status, CommandStatus::Completed);

    let snapshot = rig.pool.snapshot().await;
    let owners: Vec<_> = snapshot
        .fsp_ids()
        .map(|id| snapshot.fsp(id).and_then(|record| record.owner))
        .collect();
    assert!(owners.iter().all(|owner| owner.is_some()));
    assert_eq!(owners[0], owners[1]);

    first.shutdown().await;
    second.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_overlap() -> Result<()> {
    let rig = Rig::new(8, 0);
    let mut tasks = Vec::new();
    for id in 1..=8u8 {
        let pool = Arc::clone(&rig.pool);
        tasks.push(tokio::spawn(async move {
            pool.commit_with(sub(id), 64, |snapshot| {
                match snapshot.available_fsps(ProcessingMode::Corr, sub(id)).first() {
                    Some(free) => PoolChange::claim_fsps([*free]),
                    None => PoolChange::default(),
                }
            })
            .await
        }));
    }
    for task in tasks {
        task.await??;
    }

    let snapshot = rig.pool.snapshot().await;
    for id in 1..=8u8 {
        assert_eq!(snapshot.fsps_owned_by(sub(id)).len(), 1, "subarray {id}");
    }
    assert_eq!(snapshot.version, 8);
    Ok(())
}

#[tokio::test]
async fn prepared_assignment_fails_after_the_pool_moves() -> Result<()> {
    let rig = Rig::new(2, 2);
    let receptors: Vec<String> = [1, 2].iter().map(|n| receptor(*n).to_string()).collect();
    let document = json!({
        "config_id": "stale",
        "function_mode": "CORR",
        "frequency_band": "1",
        "start_freq": 350e6,
        "channel_width": 13_440,
        "channel_count": 100,
        "k_offset": 0,
        "wideband_shift": 0,
        "receptor_ids": receptors,
        "output_link_map": [[0, 1]],
    });

    let mut builder = AssignmentBuilder::new(
        Arc::clone(&rig.pool),
        SpectrumPartitioner::default(),
        sub(1),
    );
    builder.set_mode(ProcessingMode::Corr).set_config(document);
    let prepared = builder.prepare().await?;
    assert_eq!(prepared.assignment().fsp_ids().len(), 1);

    let snapshot = rig.pool.snapshot().await;
    rig.pool
        .commit(snapshot.version, sub(2), &PoolChange::claim_fsps([cbf_model::FspId::new(2)?]))
        .await?;

    assert!(matches!(
        prepared.commit(&rig.pool).await,
        Err(CbfError::ResourceConflict(_))
    ));
    assert!(rig.pool.snapshot().await.fsps_owned_by(sub(1)).is_empty());

    // a fresh attempt sees the new state and succeeds
    let assignment = builder.build().await?;
    assert_eq!(assignment.fsp_ids(), vec![cbf_model::FspId::new(1)?]);
    Ok(())
}
