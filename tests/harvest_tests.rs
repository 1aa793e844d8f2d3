mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use csu_harvester::adapters::{CollectorError, CollectorRegistry};
use csu_harvester::blockchain::RpcError;
use csu_harvester::error::{ErrorKind, FailureCategory};
use csu_harvester::models::{ProtocolFamily, TaskId};
use csu_harvester::services::{
    ArtifactStore, CheckpointFile, CollectOptions, ConnectionPool, Harvester, Selection,
    StopSignal,
};
use csu_harvester::utils::time::DateRange;
use tempfile::TempDir;

fn options(start: &str, end: &str, resume: bool) -> CollectOptions {
    CollectOptions {
        range: DateRange::parse(start, end).unwrap(),
        workers: Some(2),
        resume,
        selection: Selection::default(),
    }
}

fn registry(collector: Arc<ScriptedCollector>) -> CollectorRegistry {
    CollectorRegistry::new().with_fallback(collector)
}

#[tokio::test]
async fn test_collect_writes_artifacts_and_checkpoint() {
    let dir = TempDir::new().unwrap();
    let chain = week_chain();
    let collector = Arc::new(ScriptedCollector::new());
    let settings = settings(dir.path(), &["ethereum"], vec![aave(), comet()]);
    let harvester = Harvester::with_components(
        settings.clone(),
        pool(&[("ethereum", chain.clone())], &[]),
        registry(collector.clone()),
    )
    .unwrap();

    let report = harvester
        .collect(&options("2024-12-01", "2024-12-03", false), StopSignal::new())
        .await
        .unwrap();

    assert_eq!(report.planned, 6);
    assert_eq!(report.summary.completed, 6);
    assert_eq!(report.summary.failed, 0);
    assert!(!report.summary.stopped);
    assert_eq!(collector.calls(), 6);

    let store = ArtifactStore::new(settings.artifact_dir());
    let artifact = store
        .read("aave_v3_ethereum", date("2024-12-02"))
        .unwrap()
        .unwrap();
    assert_eq!(artifact.chain, "ethereum");
    assert_eq!(artifact.data["block"], artifact.block);
    assert!(artifact.block_timestamp < artifact.ts_end_utc);
    assert!(artifact.block_timestamp + BLOCK_TIME >= artifact.ts_end_utc);

    let checkpoint = CheckpointFile::read(&settings.checkpoint_path())
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.run_id, Some(report.run_id));
    assert_eq!(checkpoint.completed.len(), 6);
    assert!(checkpoint.failed.is_empty());
}

#[tokio::test]
async fn test_resume_after_complete_run_does_no_work() {
    let dir = TempDir::new().unwrap();
    let chain = week_chain();
    let settings = settings(dir.path(), &["ethereum"], vec![aave(), comet()]);
    let first = Harvester::with_components(
        settings.clone(),
        pool(&[("ethereum", chain.clone())], &[]),
        registry(Arc::new(ScriptedCollector::new())),
    )
    .unwrap();
    first
        .collect(&options("2024-12-01", "2024-12-03", false), StopSignal::new())
        .await
        .unwrap();

    chain.reset_call_count();
    let collector = Arc::new(ScriptedCollector::new());
    let second = Harvester::with_components(
        settings,
        pool(&[("ethereum", chain.clone())], &[]),
        registry(collector.clone()),
    )
    .unwrap();
    let report = second
        .collect(&options("2024-12-01", "2024-12-03", true), StopSignal::new())
        .await
        .unwrap();

    assert_eq!(report.planned, 0);
    assert_eq!(report.already_completed, 6);
    assert_eq!(collector.calls(), 0);
    assert_eq!(chain.call_count(), 0);
}

#[tokio::test]
async fn test_task_failures_are_recorded_and_retried_on_resume() {
    let dir = TempDir::new().unwrap();
    let chain = week_chain();
    let settings = settings(dir.path(), &["ethereum"], vec![aave(), comet()]);

    let flaky = Arc::new(ScriptedCollector::new());
    flaky.fail_unit(
        "compound_v3_usdc_ethereum",
        CollectorError::Decode("unexpected return data".to_string()),
    );
    let first = Harvester::with_components(
        settings.clone(),
        pool(&[("ethereum", chain.clone())], &[]),
        registry(flaky),
    )
    .unwrap();
    let report = first
        .collect(&options("2024-12-01", "2024-12-03", false), StopSignal::new())
        .await
        .unwrap();

    assert_eq!(report.summary.completed, 3);
    assert_eq!(report.summary.failed, 3);
    assert_eq!(
        report.summary.failures_by_category.get(&FailureCategory::Decode),
        Some(&3)
    );

    let checkpoint = CheckpointFile::read(&settings.checkpoint_path())
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.failed.len(), 3);
    assert!(checkpoint
        .failed
        .iter()
        .all(|record| record.task.unit == "compound_v3_usdc_ethereum" && record.attempts == 1));

    let fixed = Arc::new(ScriptedCollector::new());
    let second = Harvester::with_components(
        settings.clone(),
        pool(&[("ethereum", chain)], &[]),
        registry(fixed.clone()),
    )
    .unwrap();
    let report = second
        .collect(&options("2024-12-01", "2024-12-03", true), StopSignal::new())
        .await
        .unwrap();

    assert_eq!(report.planned, 3);
    assert_eq!(report.already_completed, 3);
    assert_eq!(report.summary.completed, 3);
    assert_eq!(fixed.calls(), 3);

    let checkpoint = CheckpointFile::read(&settings.checkpoint_path())
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.completed.len(), 6);
    assert!(checkpoint.failed.is_empty());
}

#[tokio::test]
async fn test_exhausted_failures_are_not_replanned() {
    let dir = TempDir::new().unwrap();
    let chain = week_chain();
    let mut settings = settings(dir.path(), &["ethereum"], vec![aave()]);
    settings.run.max_task_attempts = 2;

    let failing = || {
        let collector = Arc::new(ScriptedCollector::new());
        collector.fail_unit(
            "aave_v3_ethereum",
            CollectorError::InvalidData("empty reserve list".to_string()),
        );
        collector
    };

    for resume in [false, true] {
        let harvester = Harvester::with_components(
            settings.clone(),
            pool(&[("ethereum", chain.clone())], &[]),
            registry(failing()),
        )
        .unwrap();
        let report = harvester
            .collect(&options("2024-12-01", "2024-12-01", resume), StopSignal::new())
            .await
            .unwrap();
        assert_eq!(report.summary.failed, 1);
    }

    let collector = failing();
    let harvester = Harvester::with_components(
        settings,
        pool(&[("ethereum", chain)], &[]),
        registry(collector.clone()),
    )
    .unwrap();
    let report = harvester
        .collect(&options("2024-12-01", "2024-12-01", true), StopSignal::new())
        .await
        .unwrap();

    assert_eq!(report.planned, 0);
    assert_eq!(
        report.exhausted,
        vec![TaskId::new("aave_v3_ethereum", date("2024-12-01"))]
    );
    assert_eq!(collector.calls(), 0);
}

#[tokio::test]
async fn test_predeployment_dates_are_skipped() {
    let dir = TempDir::new().unwrap();
    let late = unit(
        "spark_ethereum",
        "ethereum",
        AAVE_POOL,
        ProtocolFamily::SparkLend,
        Some("2024-12-02"),
    );
    let settings = settings(dir.path(), &["ethereum"], vec![late]);
    let harvester = Harvester::with_components(
        settings.clone(),
        pool(&[("ethereum", week_chain())], &[]),
        registry(Arc::new(ScriptedCollector::new())),
    )
    .unwrap();

    let report = harvester
        .collect(&options("2024-12-01", "2024-12-03", false), StopSignal::new())
        .await
        .unwrap();

    assert_eq!(report.summary.skipped, 1);
    assert_eq!(report.summary.completed, 2);

    let store = ArtifactStore::new(settings.artifact_dir());
    assert!(!store.exists("spark_ethereum", date("2024-12-01")));
    assert!(store.exists("spark_ethereum", date("2024-12-02")));
}

#[tokio::test]
async fn test_chain_without_endpoint_fails_its_tasks_only() {
    let dir = TempDir::new().unwrap();
    let spark = unit(
        "spark_gnosis",
        "gnosis",
        SPARK_GNOSIS,
        ProtocolFamily::SparkLend,
        None,
    );
    let settings = settings(dir.path(), &["ethereum", "gnosis"], vec![aave(), spark]);
    let harvester = Harvester::with_components(
        settings,
        pool(&[("ethereum", week_chain())], &["gnosis"]),
        registry(Arc::new(ScriptedCollector::new())),
    )
    .unwrap();

    let report = harvester
        .collect(&options("2024-12-01", "2024-12-02", false), StopSignal::new())
        .await
        .unwrap();

    assert_eq!(report.summary.completed, 2);
    assert_eq!(report.summary.failed, 2);
    assert_eq!(
        report
            .summary
            .failures_by_category
            .get(&FailureCategory::NoEndpoint),
        Some(&2)
    );
}

#[tokio::test]
async fn test_selection_errors_are_configuration_errors() {
    let dir = TempDir::new().unwrap();
    let spark = unit(
        "spark_gnosis",
        "gnosis",
        SPARK_GNOSIS,
        ProtocolFamily::SparkLend,
        None,
    );
    let settings = settings(dir.path(), &["ethereum", "gnosis"], vec![aave(), spark]);
    let harvester = Harvester::with_components(
        settings,
        pool(&[("ethereum", week_chain())], &["gnosis"]),
        registry(Arc::new(ScriptedCollector::new())),
    )
    .unwrap();

    let only_gnosis = Selection {
        chains: vec!["gnosis".to_string()],
        ..Selection::default()
    };
    let err = harvester.select_units(&only_gnosis).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let unknown_chain = Selection {
        chains: vec!["fantom".to_string()],
        ..Selection::default()
    };
    assert_eq!(
        harvester.select_units(&unknown_chain).unwrap_err().kind(),
        ErrorKind::Configuration
    );

    let unknown_unit = Selection {
        units: vec!["morpho_blue".to_string()],
        ..Selection::default()
    };
    assert!(harvester.select_units(&unknown_unit).is_err());

    let excluded = Selection {
        exclude_chains: vec!["gnosis".to_string()],
        ..Selection::default()
    };
    let units = harvester.select_units(&excluded).unwrap();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].name, "aave_v3_ethereum");

    // a run over gnosis alone never reaches the worker pool
    let mut opts = options("2024-12-01", "2024-12-01", false);
    opts.selection = only_gnosis;
    let err = harvester.collect(&opts, StopSignal::new()).await.unwrap_err();
    assert!(err.kind().is_fatal());
}

#[tokio::test]
async fn test_stop_signal_halts_dispatch_and_flushes() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &["ethereum"], vec![aave()]);
    let collector = Arc::new(ScriptedCollector::with_delay(Duration::from_millis(200)));
    let harvester = Harvester::with_components(
        settings.clone(),
        pool(&[("ethereum", week_chain())], &[]),
        registry(collector),
    )
    .unwrap();

    let stop = StopSignal::new();
    let trigger = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.stop();
    });

    let mut opts = options("2024-12-01", "2024-12-05", false);
    opts.workers = Some(1);
    let report = harvester.collect(&opts, stop).await.unwrap();
    let summary = &report.summary;

    assert!(summary.stopped);
    assert!(summary.completed >= 1);
    assert!(summary.not_started >= 1);
    assert_eq!(summary.completed + summary.failed + summary.not_started, 5);

    let checkpoint = CheckpointFile::read(&settings.checkpoint_path())
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.completed.len(), summary.completed);
}

#[tokio::test]
async fn test_artifact_write_failure_aborts_run() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &["ethereum"], vec![aave()]);
    fs::write(settings.artifact_dir(), b"not a directory").unwrap();

    let harvester = Harvester::with_components(
        settings.clone(),
        pool(&[("ethereum", week_chain())], &[]),
        registry(Arc::new(ScriptedCollector::new())),
    )
    .unwrap();

    let err = harvester
        .collect(&options("2024-12-01", "2024-12-02", false), StopSignal::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Persistence);

    let checkpoint = CheckpointFile::read(&settings.checkpoint_path()).unwrap();
    let completed = checkpoint.map(|file| file.completed.len()).unwrap_or(0);
    assert_eq!(completed, 0);
}

#[tokio::test]
async fn test_redo_produces_identical_artifacts() {
    let dir = TempDir::new().unwrap();
    let chain = week_chain();
    let settings = settings(dir.path(), &["ethereum"], vec![aave()]);
    let store = ArtifactStore::new(settings.artifact_dir());
    let path = store.path_for("aave_v3_ethereum", date("2024-12-02"));

    let mut contents = Vec::new();
    for _ in 0..2 {
        let harvester = Harvester::with_components(
            settings.clone(),
            pool(&[("ethereum", chain.clone())], &[]),
            registry(Arc::new(ScriptedCollector::new())),
        )
        .unwrap();
        harvester
            .collect(&options("2024-12-02", "2024-12-02", false), StopSignal::new())
            .await
            .unwrap();
        contents.push(fs::read(&path).unwrap());
    }

    assert_eq!(contents[0], contents[1]);
}

#[tokio::test]
async fn test_transient_collector_errors_are_retried_in_run() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &["ethereum"], vec![aave()]);
    let collector = Arc::new(ScriptedCollector::new());
    collector.fail_transiently(2);

    let harvester = Harvester::with_components(
        settings,
        pool(&[("ethereum", week_chain())], &[]),
        registry(collector.clone()),
    )
    .unwrap();
    let report = harvester
        .collect(&options("2024-12-01", "2024-12-01", false), StopSignal::new())
        .await
        .unwrap();

    assert_eq!(report.summary.completed, 1);
    assert_eq!(collector.calls(), 3);
}

#[tokio::test]
async fn test_unregistered_family_fails_with_reason() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &["ethereum"], vec![aave(), comet()]);
    let only_aave = CollectorRegistry::new()
        .register(ProtocolFamily::AaveV3, Arc::new(ScriptedCollector::new()));

    let harvester = Harvester::with_components(
        settings.clone(),
        pool(&[("ethereum", week_chain())], &[]),
        only_aave,
    )
    .unwrap();
    let report = harvester
        .collect(&options("2024-12-01", "2024-12-01", false), StopSignal::new())
        .await
        .unwrap();

    assert_eq!(report.summary.completed, 1);
    assert_eq!(report.summary.failed, 1);

    let checkpoint = CheckpointFile::read(&settings.checkpoint_path())
        .unwrap()
        .unwrap();
    assert!(checkpoint.failed[0]
        .reason
        .contains("no collector for protocol family"));
}

fn refused() -> RpcError {
    RpcError::Connection {
        endpoint: "sim".to_string(),
        message: "connection refused".to_string(),
    }
}

#[tokio::test]
async fn test_unreachable_chain_fails_fast_after_warm_up() {
    let dir = TempDir::new().unwrap();
    let chain = week_chain();
    chain.set_outage(Some(refused()));
    let collector = Arc::new(ScriptedCollector::new());
    let settings = settings(dir.path(), &["ethereum"], vec![aave(), comet()]);
    let harvester = Harvester::with_components(
        settings,
        pool(&[("ethereum", chain.clone())], &[]),
        registry(collector.clone()),
    )
    .unwrap();

    let report = harvester
        .collect(&options("2024-12-01", "2024-12-03", false), StopSignal::new())
        .await
        .unwrap();

    assert_eq!(report.summary.failed, 6);
    assert_eq!(
        report
            .summary
            .failures_by_category
            .get(&FailureCategory::Resolution),
        Some(&6)
    );
    // one retried request during warm-up, nothing per task
    assert_eq!(chain.call_count(), fast_retry().max_attempts as u64);
    assert_eq!(collector.calls(), 0);
}

#[tokio::test]
async fn test_unreachable_chain_still_collects_cached_dates() {
    let dir = TempDir::new().unwrap();
    let chain = week_chain();
    let settings = settings(dir.path(), &["ethereum"], vec![aave(), comet()]);
    Harvester::with_components(
        settings.clone(),
        pool(&[("ethereum", chain.clone())], &[]),
        registry(Arc::new(ScriptedCollector::new())),
    )
    .unwrap()
    .collect(&options("2024-12-01", "2024-12-01", false), StopSignal::new())
    .await
    .unwrap();

    chain.set_outage(Some(refused()));
    chain.reset_call_count();
    let harvester = Harvester::with_components(
        settings,
        pool(&[("ethereum", chain.clone())], &[]),
        registry(Arc::new(ScriptedCollector::new())),
    )
    .unwrap();
    let report = harvester
        .collect(&options("2024-12-01", "2024-12-02", false), StopSignal::new())
        .await
        .unwrap();

    assert_eq!(report.summary.completed, 2);
    assert_eq!(report.summary.failed, 2);
    assert_eq!(chain.call_count(), fast_retry().max_attempts as u64);
}

#[tokio::test]
async fn test_check_endpoints_reports_each_endpoint() {
    let dir = TempDir::new().unwrap();
    let down = week_chain();
    down.set_outage(Some(refused()));
    let banned = week_chain();

    let pool = ConnectionPool::builder()
        .retry(fast_retry())
        .credential("ethereum", "good", week_chain(), 10_000.0)
        .unwrap()
        .credential("ethereum", "down", down.clone(), 10_000.0)
        .unwrap()
        .credential("ethereum", "banned", banned.clone(), 10_000.0)
        .unwrap()
        .public_endpoint("ethereum", "public-0", week_chain(), None)
        .unwrap()
        .credential("linea", "down", down.clone(), 10_000.0)
        .unwrap()
        .chain("gnosis", 10)
        .build()
        .unwrap();
    pool.blacklist("ethereum", "banned", "401 Unauthorized");

    let settings = settings(dir.path(), &["ethereum", "linea", "gnosis"], vec![aave()]);
    let harvester = Harvester::with_components(
        settings,
        Arc::new(pool),
        registry(Arc::new(ScriptedCollector::new())),
    )
    .unwrap();

    let reports = harvester.check_endpoints(&[]).await.unwrap();
    let chains: Vec<&str> = reports.iter().map(|r| r.chain.as_str()).collect();
    assert_eq!(chains, vec!["ethereum", "gnosis", "linea"]);

    let ethereum = &reports[0];
    assert!(ethereum.is_reachable());
    let by_label = |label: &str| {
        ethereum
            .endpoints
            .iter()
            .find(|e| e.label == label)
            .unwrap()
            .clone()
    };
    assert_eq!(by_label("good").latest_block, Some(7 * 144 - 1));
    assert!(by_label("down").error.as_deref().unwrap().contains("connection refused"));
    assert!(by_label("banned").blacklisted);
    assert!(by_label("banned").latest_block.is_none());
    assert!(by_label("public-0").public && by_label("public-0").is_healthy());
    assert_eq!(banned.call_count(), 0);

    assert!(reports[1].endpoints.is_empty());
    assert!(!reports[1].is_reachable());
    assert!(!reports[2].is_reachable());

    let only_linea = harvester.check_endpoints(&["linea".to_string()]).await.unwrap();
    assert_eq!(only_linea.len(), 1);
    assert!(harvester.check_endpoints(&["fantom".to_string()]).await.is_err());
}
