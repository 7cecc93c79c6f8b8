mod common;

use std::sync::Arc;

use common::{download_plan, fast_policy, seeded};
use courier::core::Scheduler;
use courier::error::ErrorKind;
use courier::remote::{Connector, Credentials, Fault, SimulatedConnector, endpoint};
use courier::session::{SessionManager, SessionOptions};
use courier::storage::{SqliteStorage, Storage};
use tokio_util::sync::CancellationToken;

async fn logged_in(
    sim: Arc<courier::remote::SimulatedService>,
    takeout: bool,
) -> (SessionManager, Arc<SimulatedConnector>) {
    let connector = Arc::new(SimulatedConnector::new(sim));
    let storage = SqliteStorage::open_in_memory().await.unwrap();
    let options = SessionOptions {
        takeout,
        retry: fast_policy(),
        ..SessionOptions::default()
    };
    let dyn_connector: Arc<dyn Connector> = connector.clone();
    let namespace = storage.open("acct").await.unwrap();
    let sessions = SessionManager::new(dyn_connector, namespace, options);
    sessions
        .login(&Credentials {
            phone: "+44 20 7946 0000".into(),
            code: "00000".into(),
            password: None,
        })
        .await
        .unwrap();
    (sessions, connector)
}

#[tokio::test]
async fn transfer_runs_inside_a_takeout_session() {
    let dir = tempfile::tempdir().unwrap();
    let sim = seeded(3, 2048);
    let (sessions, connector) = logged_in(sim.clone(), true).await;

    let plan = download_plan(dir.path(), 1..=3, 4096);
    let (summary, takeout_id) = sessions
        .run(|client| async move {
            let takeout_id = client.takeout_id;
            let summary =
                Scheduler::new(client.service, client.throttle, client.namespace, fast_policy())
                    .run(&plan, &CancellationToken::new())
                    .await?;
            Ok((summary, takeout_id))
        })
        .await
        .unwrap();

    assert_eq!(summary.done, 3);
    let takeout_id = takeout_id.expect("takeout opened");
    let fetches: Vec<_> = sim
        .calls()
        .into_iter()
        .filter(|c| c.endpoint == endpoint::GET_FILE)
        .collect();
    assert_eq!(fetches.len(), 3);
    assert!(fetches.iter().all(|c| c.takeout == Some(takeout_id)));
    assert_eq!(sim.finished_takeouts(), vec![(takeout_id, true)]);
    assert_eq!(connector.connects(), 2);
    assert_eq!(sim.finished_takeouts().len(), 1);
    assert!(sim.finished_takeouts()[0].1);
    assert_eq!(sim.open_takeouts(), 0);
    assert_eq!(sim.close_count(), 2);
}

#[tokio::test]
async fn revoked_session_mid_run_finishes_takeout_unsuccessfully() {
    let dir = tempfile::tempdir().unwrap();
    let sim = seeded(4, 2048);
    let (sessions, _) = logged_in(sim.clone(), true).await;
    sim.inject(endpoint::GET_FILE, Fault::Unauthorized);

    let mut plan = download_plan(dir.path(), 1..=4, 4096);
    plan.concurrency = 1;
    let err = sessions
        .run(|client| async move {
            Scheduler::new(client.service, client.throttle, client.namespace, fast_policy())
                .run(&plan, &CancellationToken::new())
                .await
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::FatalSession);
    assert_eq!(sim.finished_takeouts().len(), 1);
    assert!(!sim.finished_takeouts()[0].1);
    assert_eq!(sim.close_count(), 2);
}

#[tokio::test]
async fn session_is_refreshed_after_restore() {
    let sim = seeded(0, 0);
    let (sessions, _) = logged_in(sim.clone(), false).await;

    let user = sessions.run(|client| async move { Ok(client.info) }).await.unwrap();
    assert_eq!(user.user_id, 442079460000);
    assert_eq!(sessions.stored_user().await.unwrap(), Some(user));
    assert!(
        sessions
            .namespace()
            .contains("session:desktop")
            .await
            .unwrap()
    );
}
