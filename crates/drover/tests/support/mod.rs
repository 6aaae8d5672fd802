//! Shared fixtures for the pipeline scenario tests
//!
//! [`ScriptedSubject`] is a minimal HTTP/1.1 server on a raw `TcpListener`.
//! Each request pops the next [`Reply`] from its script (or the fallback once
//! the script is used up) and is captured for later assertions.

#![allow(dead_code)]

use drover::http::{ExecutorConfig, HttpExecutor};
use drover::pipeline::{
    FetcherSettings, PipelineSettings, ProviderSettings, Runner, WriterSettings,
};
use drover::query::{QueryBuilder, TwoTableQuery};
use drover::request::{Method, Target};
use drover::subjects::{JsonParams, JsonRecord, JsonSubject};
use drover::testing::{MockSink, MockSource};
use drover::traits::{RetryConfig, SharedCircuitBreaker};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Initialize tracing for tests
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// How the subject answers one request
#[derive(Debug, Clone)]
pub enum Reply {
    /// Status with a JSON body
    Json(u16, &'static str),
    /// Read the request and never answer
    Hang,
}

impl Reply {
    pub fn ok() -> Self {
        Self::Json(200, r#"{"ok":true}"#)
    }

    pub fn status(code: u16) -> Self {
        Self::Json(code, r#"{"error":"scripted"}"#)
    }
}

/// One request as seen by the subject
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    /// Path and query string
    pub target: String,
    /// Header names are lower-cased
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
struct State {
    script: VecDeque<Reply>,
    fallback: Reply,
    requests: Vec<CapturedRequest>,
}

/// Scripted HTTP subject
pub struct ScriptedSubject {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    task: JoinHandle<()>,
}

impl ScriptedSubject {
    /// Serve `script` in order, then `fallback` forever
    pub async fn start(script: Vec<Reply>, fallback: Reply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State {
            script: script.into(),
            fallback,
            requests: Vec::new(),
        }));

        let shared = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, shared.clone()));
            }
        });

        Self { addr, state, task }
    }

    /// Answer every request the same way
    pub async fn always(reply: Reply) -> Self {
        Self::start(Vec::new(), reply).await
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn target(&self, endpoint: &str, method: Method) -> Arc<Target> {
        Arc::new(Target::new("http", "127.0.0.1", self.port(), endpoint, method, vec![]).unwrap())
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.state.lock().requests.clone()
    }

    pub fn hits(&self) -> usize {
        self.state.lock().requests.len()
    }
}

impl Drop for ScriptedSubject {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<State>>) {
    let Ok(Some(request)) = read_request(&mut stream).await else {
        return;
    };

    let reply = {
        let mut state = state.lock();
        state.requests.push(request);
        let fallback = state.fallback.clone();
        state.script.pop_front().unwrap_or(fallback)
    };

    match reply {
        Reply::Hang => {
            // hold the socket open until the client gives up
            let mut sink = [0u8; 256];
            while let Ok(n) = stream.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
        }
        Reply::Json(code, body) => {
            let response = format!(
                "HTTP/1.1 {} Scripted\r\n\
                 Content-Type: application/json\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\r\n{}",
                code,
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    }
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<CapturedRequest>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Some(CapturedRequest {
        method,
        target,
        headers,
        body,
    }))
}

/// Reference rows with ids `ids` and an empty payload
pub fn rows(ids: &[u64]) -> Vec<JsonParams> {
    ids.iter().map(|id| JsonParams::new(*id, "{}")).collect()
}

pub fn executor(
    timeout: Duration,
    retries: u32,
    breaker: Option<SharedCircuitBreaker>,
) -> Arc<HttpExecutor> {
    Arc::new(
        HttpExecutor::new(
            ExecutorConfig {
                attempt_timeout: timeout,
                retry: RetryConfig::window(
                    retries,
                    Duration::from_millis(5),
                    Duration::from_millis(20),
                ),
                pool_max_idle_per_host: 4,
            },
            breaker,
        )
        .unwrap(),
    )
}

/// Small, fast settings; `workers` fetchers, no warm-up
pub fn settings(workers: usize, idle_time: Duration) -> PipelineSettings {
    PipelineSettings {
        tag: "scenario".to_string(),
        provider: ProviderSettings {
            select_batch_size: 10,
            select_retry: RetryConfig::window(
                1,
                Duration::from_millis(1),
                Duration::from_millis(2),
            ),
            sleep_time: Duration::from_millis(50),
        },
        fetcher: FetcherSettings {
            min_workers: workers,
            max_workers: workers,
            warmup: None,
            idle_time,
            stats_interval: Duration::from_secs(60),
            breaker_pause: Duration::from_millis(10),
            result_capacity: drover::pipeline::result_capacity(4),
        },
        writer: WriterSettings {
            insert_batch_size: 4,
            db_save_timeout: Duration::from_secs(2),
        },
    }
}

/// Two-table runner over in-memory stores
pub fn two_table_runner(
    source: &MockSource<JsonParams>,
    sink: &MockSink<JsonRecord>,
    target: Arc<Target>,
    executor: Arc<HttpExecutor>,
    settings: PipelineSettings,
) -> Runner<JsonSubject> {
    let query: Box<dyn QueryBuilder<JsonParams>> = Box::new(TwoTableQuery::new("ref", 10));
    Runner::new(
        Arc::new(source.clone()),
        vec![Arc::new(sink.clone())],
        query,
        target,
        executor,
        settings,
    )
}
