//! End-to-end pipeline scenarios
//!
//! In-memory source and sink, real HTTP against a scripted subject on
//! loopback.
//!
//! Run with: cargo test -p drover --test pipeline_scenarios -- --nocapture

mod support;

use anyhow::Result;
use drover::pipeline::Runner;
use drover::query::{ContinuousQuery, QueryBuilder};
use drover::request::{BodyMutator, Method, Request, Target};
use drover::subjects::{JsonParams, JsonRecord, JsonSubject};
use drover::testing::{MockSink, MockSource};
use drover::traits::{CircuitBreakerConfig, CircuitState, SharedCircuitBreaker};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use support::*;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn statuses(records: &[JsonRecord]) -> Vec<u16> {
    records.iter().map(|r| r.status_code).collect()
}

fn attempts(records: &[JsonRecord]) -> Vec<u32> {
    records.iter().map(|r| r.attempt).collect()
}

// =============================================================================
// SCENARIOS
// =============================================================================

/// S1: five rows, subject answers 200 on the first try, the run drains and exits
#[tokio::test]
async fn test_s1_two_table_drain() -> Result<()> {
    init_tracing();

    let subject = ScriptedSubject::always(Reply::ok()).await;
    let source = MockSource::new()
        .with_batch(rows(&[1, 2, 3, 4, 5]))
        .with_empty();
    let sink = MockSink::new("results");
    let idle_time = Duration::from_secs(2);

    let runner = two_table_runner(
        &source,
        &sink,
        subject.target("/lookup", Method::Get),
        executor(Duration::from_secs(1), 3, None),
        settings(2, idle_time),
    );
    let report = tokio::time::timeout(idle_time, runner.run(CancellationToken::new())).await??;

    let records = sink.rows();
    let mut ids: Vec<u64> = records.iter().map(|r| r.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert!(records.iter().all(|r| r.attempt == 1 && r.status_code == 200));
    assert!(records.iter().all(|r| r.tag == "scenario"));
    assert_eq!(subject.hits(), 5);
    assert_eq!(report.provider.requests, 5);
    assert_eq!(report.writer.write.records_written, 5);
    // two-table mode creates the sink table first
    assert_eq!(sink.ddl().len(), 1);

    info!("S1 passed");
    Ok(())
}

/// S2: 503, 503, 200 for one row yields three records
#[tokio::test]
async fn test_s2_transient_5xx() -> Result<()> {
    init_tracing();

    let subject = ScriptedSubject::start(
        vec![Reply::status(503), Reply::status(503), Reply::ok()],
        Reply::ok(),
    )
    .await;
    let source = MockSource::new().with_batch(rows(&[1]));
    let sink = MockSink::new("results");

    let runner = two_table_runner(
        &source,
        &sink,
        subject.target("/lookup", Method::Get),
        executor(Duration::from_secs(1), 3, None),
        settings(1, Duration::from_secs(2)),
    );
    runner.run(CancellationToken::new()).await?;

    let records = sink.rows();
    assert_eq!(statuses(&records), vec![503, 503, 200]);
    assert_eq!(attempts(&records), vec![1, 2, 3]);
    assert!(records.iter().all(|r| r.id == 1));
    assert_eq!(records[2].response, r#"{"ok":true}"#);
    Ok(())
}

/// S3: subject never answers; 100ms timeout and 2 retries give three 599 records
#[tokio::test]
async fn test_s3_hard_timeout() -> Result<()> {
    init_tracing();

    let subject = ScriptedSubject::always(Reply::Hang).await;
    let source = MockSource::new().with_batch(rows(&[1]));
    let sink = MockSink::new("results");

    let runner = two_table_runner(
        &source,
        &sink,
        subject.target("/lookup", Method::Get),
        executor(Duration::from_millis(100), 2, None),
        settings(1, Duration::from_secs(2)),
    );
    runner.run(CancellationToken::new()).await?;

    let records = sink.rows();
    assert_eq!(statuses(&records), vec![599, 599, 599]);
    assert_eq!(attempts(&records), vec![1, 2, 3]);
    assert!(records.iter().all(|r| !r.error.is_empty()));
    assert_eq!(subject.hits(), 3);
    Ok(())
}

/// S4: ten 5xx rows against a breaker that trips after 3 consecutive failures
#[tokio::test]
async fn test_s4_breaker_trip() -> Result<()> {
    init_tracing();

    let breaker_timeout = Duration::from_secs(1);
    let breaker = SharedCircuitBreaker::with_config(CircuitBreakerConfig {
        max_requests: 1,
        interval: Duration::ZERO,
        timeout: breaker_timeout,
        consecutive_failures: 3,
        total_failures_per_interval: 0,
    });
    let subject = ScriptedSubject::always(Reply::status(500)).await;
    let target = subject.target("/lookup", Method::Get);
    let executor = executor(Duration::from_secs(1), 0, Some(breaker.clone()));
    let source = MockSource::new().with_batch(rows(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]));
    let sink = MockSink::new("results");

    let runner = two_table_runner(
        &source,
        &sink,
        target.clone(),
        executor.clone(),
        settings(1, Duration::from_secs(2)),
    );
    let report = runner.run(CancellationToken::new()).await?;

    // requests 1-3 reach the subject, 4-10 are turned away
    let records = sink.rows();
    assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(statuses(&records), vec![500, 500, 500]);
    assert_eq!(subject.hits(), 3);
    assert_eq!(report.fetcher.rejected, 7);
    assert_eq!(breaker.state(), CircuitState::Open);

    // once the open period is over a probe goes through
    tokio::time::sleep(breaker_timeout + Duration::from_millis(100)).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let probe = Request::new(target, JsonParams::new(11, "{}"));
    let outcome = executor
        .execute::<JsonParams, serde_json::Value>(&probe, &CancellationToken::new())
        .await;
    let probe_attempts = outcome.expect("probe should be admitted");
    assert_eq!(probe_attempts.len(), 1);
    assert_eq!(probe_attempts[0].status, 500);
    assert_eq!(subject.hits(), 4);
    assert_eq!(breaker.state(), CircuitState::Open);
    Ok(())
}

/// S5: an empty poll in continuous mode sleeps, resets the cursor and polls again
#[tokio::test]
async fn test_s5_continuous_quiesce() -> Result<()> {
    init_tracing();

    let subject = ScriptedSubject::always(Reply::ok()).await;
    let source = MockSource::new().with_batch(vec![
        JsonParams::new(1, "{}").with_ts(100),
        JsonParams::new(2, "{}").with_ts(100),
        JsonParams::new(3, "{}").with_ts(100),
    ]);
    let sink = MockSink::new("status");
    let mut settings = settings(2, Duration::from_secs(10));
    let sleep_time = settings.provider.sleep_time;
    settings.writer.insert_batch_size = 1;

    let query: Box<dyn QueryBuilder<JsonParams>> = Box::new(ContinuousQuery::new(
        "ref",
        "status",
        10,
        Duration::from_secs(3600),
    ));
    let runner: Runner<JsonSubject> = Runner::new(
        Arc::new(source.clone()),
        vec![Arc::new(sink.clone())],
        query,
        subject.target("/lookup", Method::Get),
        executor(Duration::from_secs(1), 0, None),
        settings,
    );

    let cancel = CancellationToken::new();
    let pipeline = tokio::spawn(runner.run(cancel.clone()));

    tokio::time::timeout(Duration::from_secs(5), async {
        while source.calls().len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    cancel.cancel();
    let report = pipeline.await??;

    let calls = source.calls();
    // first pass: rows absorbed, cursor at (100, 3)
    assert!(calls[0].sql.contains("(ts, id) > (0, 0)"));
    assert!(calls[1].sql.contains("(ts, id) > (100, 3)"));
    // empty poll: quiesce for sleep_time, reset, poll again
    assert!(calls[2].at.duration_since(calls[1].at) >= sleep_time);
    assert!(calls[2].sql.contains("(ts, id) > (0, 0)"));

    assert!(report.provider.empty_polls >= 1);
    assert_eq!(sink.rows().len(), 3);
    // no DDL outside two-table mode
    assert!(sink.ddl().is_empty());
    Ok(())
}

/// A quiesce longer than `idle_time` shrinks the pool but does not end the run
#[tokio::test]
async fn test_continuous_quiesce_outlasting_idle_time() -> Result<()> {
    init_tracing();

    let subject = ScriptedSubject::always(Reply::ok()).await;
    let source = MockSource::new()
        .with_batch(vec![
            JsonParams::new(1, "{}").with_ts(100),
            JsonParams::new(2, "{}").with_ts(100),
        ])
        .with_empty()
        .with_batch(vec![JsonParams::new(3, "{}").with_ts(200)]);
    let sink = MockSink::new("status");
    let mut settings = settings(2, Duration::from_millis(100));
    settings.fetcher.min_workers = 1;
    settings.provider.sleep_time = Duration::from_millis(300);
    settings.writer.insert_batch_size = 1;

    let query: Box<dyn QueryBuilder<JsonParams>> = Box::new(ContinuousQuery::new(
        "ref",
        "status",
        10,
        Duration::from_secs(3600),
    ));
    let runner: Runner<JsonSubject> = Runner::new(
        Arc::new(source.clone()),
        vec![Arc::new(sink.clone())],
        query,
        subject.target("/lookup", Method::Get),
        executor(Duration::from_secs(1), 0, None),
        settings,
    );

    let cancel = CancellationToken::new();
    let pipeline = tokio::spawn(runner.run(cancel.clone()));

    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.rows().len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    // still running after the row that arrived post-quiesce
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!pipeline.is_finished());

    cancel.cancel();
    let report = pipeline.await??;

    let mut ids: Vec<u64> = sink.rows().iter().map(|r| r.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(report.fetcher.idle_exits, 1);
    assert!(report.provider.empty_polls >= 1);
    info!("Quiesce longer than idle_time passed");
    Ok(())
}

/// S6: a body file is sent verbatim on every POST
#[tokio::test]
async fn test_s6_body_from_file_post() -> Result<()> {
    init_tracing();

    let mut body_file = tempfile::NamedTempFile::new()?;
    body_file.write_all(br#"{"k":"v"}"#)?;
    body_file.flush()?;

    let subject = ScriptedSubject::always(Reply::ok()).await;
    let source = MockSource::new().with_batch(vec![
        JsonParams::new(1, r#"{"row":1}"#),
        JsonParams::new(2, r#"{"row":2}"#),
    ]);
    let sink = MockSink::new("results");

    let runner = two_table_runner(
        &source,
        &sink,
        subject.target("/submit", Method::Post),
        executor(Duration::from_secs(1), 0, None),
        settings(2, Duration::from_secs(2)),
    )
    .with_body_mutator(BodyMutator::from_file(body_file.path())?);
    let report = runner.run(CancellationToken::new()).await?;

    let requests = subject.requests();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(request.method, "POST");
        assert_eq!(request.target, "/submit");
        assert_eq!(request.body, br#"{"k":"v"}"#.to_vec());
        assert_eq!(request.header("content-type"), Some("application/json"));
    }
    assert_eq!(requests[0].body, requests[1].body);
    assert_eq!(report.provider.bodies_applied, 2);
    assert_eq!(sink.rows().len(), 2);
    Ok(())
}

// =============================================================================
// PROPERTIES
// =============================================================================

/// 4xx answers (429 included) are final: one attempt, one record each
#[tokio::test]
async fn test_client_errors_are_not_retried() -> Result<()> {
    init_tracing();

    let subject =
        ScriptedSubject::start(vec![Reply::status(404), Reply::status(429)], Reply::ok()).await;
    let source = MockSource::new().with_batch(rows(&[1, 2]));
    let sink = MockSink::new("results");

    let runner = two_table_runner(
        &source,
        &sink,
        subject.target("/lookup", Method::Get),
        executor(Duration::from_secs(1), 3, None),
        settings(1, Duration::from_secs(2)),
    );
    runner.run(CancellationToken::new()).await?;

    let records = sink.rows();
    assert_eq!(statuses(&records), vec![404, 429]);
    assert_eq!(attempts(&records), vec![1, 1]);
    assert_eq!(subject.hits(), 2);
    Ok(())
}

/// GET requests carry the payload and the static params in the query string
#[tokio::test]
async fn test_get_query_string() -> Result<()> {
    init_tracing();

    let subject = ScriptedSubject::always(Reply::ok()).await;
    let target = Arc::new(Target::new(
        "http",
        "127.0.0.1",
        subject.port(),
        "/v1/lookup",
        Method::Get,
        vec![("key".to_string(), "abc".to_string())],
    )?);
    let source = MockSource::new().with_batch(vec![JsonParams::new(1, r#"{"q":"berlin"}"#)]);
    let sink = MockSink::new("results");

    let runner = two_table_runner(
        &source,
        &sink,
        target,
        executor(Duration::from_secs(1), 0, None),
        settings(1, Duration::from_secs(2)),
    );
    runner.run(CancellationToken::new()).await?;

    let requests = subject.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].target, "/v1/lookup?key=abc&q=berlin");
    assert!(requests[0].body.is_empty());
    assert!(sink.rows()[0].url.ends_with("/v1/lookup?key=abc&q=berlin"));
    Ok(())
}

/// Every row reaches every sink, and a failing sink does not stop the others
#[tokio::test]
async fn test_fan_out_with_failing_sink() -> Result<()> {
    init_tracing();

    let subject = ScriptedSubject::always(Reply::ok()).await;
    let source = MockSource::new().with_batch(rows(&[1, 2, 3, 4, 5, 6]));
    let primary = MockSink::new("results");
    let broken = MockSink::new("mirror").fail_with("connection refused");

    let query: Box<dyn QueryBuilder<JsonParams>> =
        Box::new(drover::query::TwoTableQuery::new("ref", 10));
    let runner: Runner<JsonSubject> = Runner::new(
        Arc::new(source),
        vec![Arc::new(primary.clone()), Arc::new(broken.clone())],
        query,
        subject.target("/lookup", Method::Get),
        executor(Duration::from_secs(1), 0, None),
        settings(3, Duration::from_secs(2)),
    );
    let report = runner.run(CancellationToken::new()).await?;

    assert_eq!(primary.rows().len(), 6);
    assert!(broken.rows().is_empty());
    assert_eq!(report.writer.write.records_written, 6);
    assert_eq!(report.writer.write.records_failed, 6);
    Ok(())
}

/// Cancelling a run mid-flight still flushes what reached the writer
#[tokio::test]
async fn test_cancel_flushes_received_records() -> Result<()> {
    init_tracing();

    let subject = ScriptedSubject::always(Reply::Hang).await;
    let source = MockSource::new().with_batch(rows(&[1, 2, 3]));
    let sink = MockSink::new("results");

    let runner = two_table_runner(
        &source,
        &sink,
        subject.target("/lookup", Method::Get),
        executor(Duration::from_secs(30), 0, None),
        settings(3, Duration::from_secs(60)),
    );
    let cancel = CancellationToken::new();
    let pipeline = tokio::spawn(runner.run(cancel.clone()));

    tokio::time::timeout(Duration::from_secs(5), async {
        while subject.hits() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    cancel.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), pipeline).await???;
    // in-flight requests are abandoned without a record
    assert!(sink.rows().is_empty());
    assert_eq!(report.fetcher.requests, 0);
    Ok(())
}
