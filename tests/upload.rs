mod common;

use common::{namespace, scheduler};
use courier::core::plan::UploadOptions;
use courier::core::{ExtFilter, PlanOptions, TransferPlan, UnitSelector};
use courier::remote::{SimulatedService, endpoint};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn directory_upload_honors_filters_and_dedup() {
    let src = tempfile::tempdir().unwrap();
    std::fs::create_dir(src.path().join("nested")).unwrap();
    std::fs::write(src.path().join("a.JPG"), vec![1u8; 9000]).unwrap();
    std::fs::write(src.path().join("notes.txt"), b"skip me").unwrap();
    std::fs::write(src.path().join("nested/b.jpg"), vec![2u8; 100]).unwrap();

    let sim = Arc::new(SimulatedService::new());
    let ns = namespace("acct").await;

    let mut opts = UploadOptions::new(500);
    opts.photo = true;
    opts.chunk_size = 4096;
    let mut plan = TransferPlan::new(
        UnitSelector::LocalFiles(vec![src.path().to_path_buf()]),
        PlanOptions::Upload(opts),
    );
    plan.filter = ExtFilter::new(["jpg"], Vec::<String>::new());

    let summary = scheduler(sim.clone(), ns.clone())
        .run(&plan, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.done, 2);
    assert_eq!(summary.bytes, 9100);

    let mut sent: Vec<(String, usize, bool)> = sim
        .sent_media()
        .into_iter()
        .map(|m| (m.name, m.content.len(), m.as_photo))
        .collect();
    sent.sort();
    assert_eq!(
        sent,
        vec![("a.JPG".to_string(), 9000, true), ("b.jpg".to_string(), 100, true)]
    );
    assert_eq!(sim.calls_to(endpoint::SAVE_FILE_PART), 4);

    // Same files again: nothing is re-sent.
    let again = scheduler(sim.clone(), ns)
        .run(&plan, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.skipped, 2);
    assert_eq!(sim.calls_to(endpoint::SEND_MEDIA), 2);
}
