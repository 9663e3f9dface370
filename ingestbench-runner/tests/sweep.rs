use std::time::Duration;

use ingestbench_runner::cache::DatasetCache;
use ingestbench_runner::generator::DataGenerator;
use ingestbench_runner::matrix::{CaseMatrix, CaseSpec};
use ingestbench_runner::report::{CsvReport, MemorySink};
use ingestbench_runner::runner::{Runner, Target};
use ingestbench_service::LoadOptions;
use ingestbench_service::backend::in_memory::InMemoryBackend;
use ingestbench_service::backend::{CloningFactory, StorageConfig, create_factory};
use ingestbench_test::backends::{FailingBackend, FlakyBackend, Operation, SleepingBackend};
use ingestbench_types::{CaseKey, CaseStatus};

fn case(duration_minutes: u32, tag_count: u32, interval: u32, workers: &[usize]) -> CaseSpec {
    CaseSpec {
        key: CaseKey::new(duration_minutes, tag_count, interval),
        worker_counts: workers.to_vec(),
    }
}

fn target<B>(backend: &B, chunk_size: usize) -> Target
where
    B: ingestbench_service::backend::Backend + Clone,
{
    Target::new(
        Box::new(CloningFactory::new(backend.clone())),
        chunk_size,
        false,
    )
}

#[tokio::test]
async fn stores_every_record_once() {
    ingestbench_test::tracing::init();

    let backend = InMemoryBackend::new();
    let cases = [case(5, 10, 60, &[2])];

    let runner = Runner::new(DataGenerator::new(Some(3)));
    let results = runner
        .run(&cases, &[target(&backend, 20)], &mut MemorySink::new())
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.status, CaseStatus::Ok);
    assert_eq!(result.record_count, 50);
    assert_eq!(result.worker_count, 2);

    let rows = backend.rows(&cases[0].key.table_name()).unwrap();
    assert_eq!(rows.len(), 50);
}

#[tokio::test]
async fn failing_case_does_not_abort_sweep() {
    let cases = [
        case(5, 10, 60, &[1]),
        case(5, 20, 60, &[1]),
        case(5, 30, 60, &[1]),
    ];
    let failing = FailingBackend::new(Operation::InsertChunk).only_table(cases[1].key.table_name());

    let runner = Runner::new(DataGenerator::new(Some(3)));
    let results = runner
        .run(&cases, &[target(&failing, 20)], &mut MemorySink::new())
        .await
        .unwrap();

    let statuses: Vec<_> = results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        [CaseStatus::Ok, CaseStatus::Failed, CaseStatus::Ok]
    );

    let failed = &results[1];
    assert_eq!(failed.table_size_bytes, None);
    assert_eq!(failed.insert_duration_seconds, None);
    assert_eq!(failed.record_count, 100);
    let error = failed.error.as_deref().unwrap();
    assert!(
        error.starts_with("5 of 5 chunks failed to insert into failing"),
        "{error}"
    );

    let inner = failing.inner();
    assert_eq!(inner.rows(&cases[0].key.table_name()).unwrap().len(), 50);
    assert_eq!(inner.rows(&cases[2].key.table_name()).unwrap().len(), 150);
}

#[tokio::test]
async fn schema_failure_names_backend_and_cause() {
    let failing = FailingBackend::new(Operation::Reset);
    let cases = [case(5, 10, 60, &[1])];

    let runner = Runner::new(DataGenerator::new(Some(3)));
    let results = runner
        .run(&cases, &[target(&failing, 20)], &mut MemorySink::new())
        .await
        .unwrap();

    assert_eq!(results[0].status, CaseStatus::Failed);
    let error = results[0].error.as_deref().unwrap();
    assert!(error.starts_with("failing backend error: "), "{error}");
    assert!(error.ends_with("injected failure"), "{error}");
}

#[tokio::test]
async fn filesystem_sweeps_are_repeatable() {
    let tempdir = tempfile::tempdir().unwrap();
    let targets = [Target::new(
        create_factory(StorageConfig::FileSystem {
            path: tempdir.path(),
        }),
        20,
        false,
    )];
    let cases = [case(5, 10, 60, &[1, 3])];

    let runner = Runner::new(DataGenerator::new(Some(3)));
    let first = runner
        .run(&cases, &targets, &mut MemorySink::new())
        .await
        .unwrap();
    let second = runner
        .run(&cases, &targets, &mut MemorySink::new())
        .await
        .unwrap();

    for result in first.iter().chain(&second) {
        assert_eq!(result.backend, "filesystem");
        assert_eq!(result.status, CaseStatus::Ok, "{result:?}");
        assert!(result.table_size_bytes.unwrap() > 0);
    }

    // every measurement starts from an empty table
    assert_eq!(first[0].table_size_bytes, second[0].table_size_bytes);
}

#[tokio::test]
async fn retries_flaky_inserts() {
    let flaky = FlakyBackend::new(1);
    let cases = [case(5, 10, 60, &[2])];

    let runner = Runner::new(DataGenerator::new(Some(3))).with_load_options(LoadOptions {
        retries: 1,
        retry_backoff: Duration::ZERO,
        timeout: None,
    });
    let results = runner
        .run(&cases, &[target(&flaky, 20)], &mut MemorySink::new())
        .await
        .unwrap();

    assert_eq!(results[0].status, CaseStatus::Ok);
    assert_eq!(flaky.attempts(), 6);
    assert_eq!(
        flaky
            .inner()
            .rows(&cases[0].key.table_name())
            .unwrap()
            .len(),
        50
    );
}

#[tokio::test(start_paused = true)]
async fn slow_load_times_out() {
    let sleeping = SleepingBackend::new(Duration::from_secs(1));
    let cases = [case(5, 10, 60, &[1])];

    let runner = Runner::new(DataGenerator::new(Some(3))).with_load_options(LoadOptions {
        timeout: Some(Duration::from_millis(1500)),
        ..Default::default()
    });
    let results = runner
        .run(&cases, &[target(&sleeping, 20)], &mut MemorySink::new())
        .await
        .unwrap();

    assert_eq!(results[0].status, CaseStatus::TimedOut);
    assert_eq!(
        results[0].error.as_deref(),
        Some("load timed out after 1.5s")
    );
    assert_eq!(sleeping.chunks(), 1);
}

#[tokio::test]
async fn writes_reports_and_cache() {
    let tempdir = tempfile::tempdir().unwrap();
    let results_dir = tempdir.path().join("results");
    let cache = DatasetCache::new(tempdir.path().join("cache"));

    let matrix = CaseMatrix {
        duration_minutes: [5].into(),
        tag_count: [10].into(),
        sampling_interval_seconds: [30, 60].into(),
        worker_count: [1].into(),
    };
    let backend = InMemoryBackend::new();

    let runner = Runner::new(DataGenerator::new(Some(3))).with_cache(cache.clone());
    let mut sinks = (CsvReport::new(&results_dir), MemorySink::new());
    runner
        .run(&matrix.cases(), &[target(&backend, 20)], &mut sinks)
        .await
        .unwrap();

    assert_eq!(sinks.1.results().len(), 2);
    for key in matrix.keys() {
        assert!(cache.path(key).is_file());
    }

    let report = std::fs::read_to_string(results_dir.join("memory_1_workers_local.csv")).unwrap();
    let lines: Vec<_> = report.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("duration_minutes,tag_count,"));
    assert!(lines[1].starts_with("5,10,30,100,"));
    assert!(lines[2].starts_with("5,10,60,50,"));
}
