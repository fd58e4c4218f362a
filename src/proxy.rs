//! Upstream HTTP proxy.
//!
//! One shared `reqwest::Client` talks to every backend. Calls carry two
//! budgets: a connection timeout until response headers, and an activity
//! timeout that resets on every received chunk. Streaming bodies are
//! forwarded verbatim while a lightweight inline parser watches for the
//! first chunk with visible content (TTFT), the terminal `done` marker and
//! final token counts.
//!
//! When a client-facing timeout fires while the upstream is still working,
//! the call can be handed to a background drain that keeps listening, only
//! to learn the true response time.

use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Method;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, PairKey};

/// Byte cap when quoting upstream error bodies.
const ERROR_BODY_CAP: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("upstream did not produce response headers in time")]
    ConnectTimeout,

    #[error("upstream stalled mid-response")]
    ActivityTimeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("upstream network error: {0}")]
    Network(String),

    #[error("upstream returned HTTP {status}: {message}")]
    UpstreamStatus { status: u16, message: String },
}

impl ProxyError {
    /// Inputs for the error classifier.
    pub fn classifier_view(&self) -> (String, Option<u16>) {
        match self {
            Self::ConnectTimeout => ("upstream connection timed out".into(), None),
            Self::ActivityTimeout => ("upstream response timed out".into(), None),
            Self::Cancelled => ("request cancelled".into(), None),
            Self::Network(message) => (message.clone(), None),
            Self::UpstreamStatus { status, message } => (message.clone(), Some(*status)),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout | Self::ActivityTimeout)
    }
}

/// Both client-facing budgets for one call.
#[derive(Debug, Clone, Copy)]
pub struct CallBudgets {
    pub connect: Duration,
    pub activity: Duration,
}

/// A fully-buffered upstream response.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub latency_ms: u64,
    pub eval_count: Option<u64>,
    pub prompt_eval_count: Option<u64>,
}

/// How a forwarded stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFailure {
    ActivityTimeout,
    Upstream(String),
    Cancelled,
}

/// Terminal report for one streaming request, delivered exactly once.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub result: Result<(), StreamFailure>,
    /// Dispatch → first chunk carrying visible content.
    pub ttft_ms: Option<u64>,
    /// Dispatch → stream end.
    pub duration_ms: u64,
    pub eval_count: Option<u64>,
    pub prompt_eval_count: Option<u64>,
    /// True when the client went away before the upstream finished.
    pub client_disconnected: bool,
}

/// A streaming upstream response ready to forward.
pub struct StreamingResponse {
    pub status: u16,
    pub content_type: Option<String>,
    /// Chunks to forward verbatim.
    pub body: BoxStream<'static, Result<Bytes, std::io::Error>>,
    /// Resolves when the stream finishes (or the client drops it).
    pub outcome: oneshot::Receiver<StreamOutcome>,
}

impl StreamingResponse {
    /// Take the outcome receiver, leaving a closed placeholder. The caller
    /// that watches completion owns the real receiver; the HTTP layer only
    /// needs the body.
    pub fn take_outcome(&mut self) -> oneshot::Receiver<StreamOutcome> {
        let (_tx, placeholder) = oneshot::channel();
        std::mem::replace(&mut self.outcome, placeholder)
    }
}

/// Late measurement from a background-tracked upstream.
#[derive(Debug, Clone)]
pub struct BackgroundObservation {
    pub key: PairKey,
    pub duration_ms: u64,
    pub completed: bool,
}

/// Per-call parameters assembled by the orchestrator.
pub struct ProxyCall {
    pub key: PairKey,
    pub path: String,
    pub method: Method,
    pub body: Option<Bytes>,
    pub budgets: CallBudgets,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    background_tx: mpsc::UnboundedSender<BackgroundObservation>,
    background_tracking: bool,
    background_listen: Duration,
}

impl UpstreamClient {
    /// Build the shared client. No global request timeout: it would apply
    /// to the full streamed body and kill long generations. Budgets are
    /// enforced per call.
    pub fn new(
        background_tx: mpsc::UnboundedSender<BackgroundObservation>,
        background_tracking: bool,
        background_listen: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            background_tx,
            background_tracking,
            background_listen,
        }
    }

    fn build_request(&self, backend: &Backend, call: &ProxyCall) -> reqwest::RequestBuilder {
        let url = format!("{}{}", backend.base_url, call.path);
        let mut request = self.http.request(call.method.clone(), url);
        if let Some(body) = &call.body {
            request = request
                .header("Content-Type", "application/json")
                .body(body.clone());
        }
        if let Some(api_key) = &backend.api_key {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }
        request
    }

    /// Issue a call and buffer the whole response.
    pub async fn execute_buffered(
        &self,
        backend: &Backend,
        call: ProxyCall,
    ) -> Result<BufferedResponse, ProxyError> {
        let started = Instant::now();
        let request = self.build_request(backend, &call);
        let mut send_fut = Box::pin(request.send());

        let response = tokio::select! {
            res = &mut send_fut => res.map_err(map_send_error)?,
            _ = tokio::time::sleep(call.budgets.connect) => {
                self.track_unconnected(call.key.clone(), send_fut, started);
                return Err(ProxyError::ConnectTimeout);
            }
            _ = call.cancel.cancelled() => return Err(ProxyError::Cancelled),
        };

        let status = response.status().as_u16();
        let content_type = header_string(&response, "content-type");

        if !(200..300).contains(&status) {
            let body = read_capped_body(response, call.budgets.activity).await;
            return Err(ProxyError::UpstreamStatus {
                status,
                message: extract_error_message(&body),
            });
        }

        let mut stream = Box::pin(response.bytes_stream());
        let mut buf: Vec<u8> = Vec::new();
        let mut inspector = ChunkInspector::new();
        loop {
            tokio::select! {
                next = stream.next() => match next {
                    None => break,
                    Some(Ok(chunk)) => {
                        inspector.feed(&chunk);
                        buf.extend_from_slice(&chunk);
                    }
                    Some(Err(e)) => return Err(ProxyError::Network(e.to_string())),
                },
                _ = tokio::time::sleep(call.budgets.activity) => {
                    self.track_stalled(call.key.clone(), stream, started);
                    return Err(ProxyError::ActivityTimeout);
                }
                _ = call.cancel.cancelled() => return Err(ProxyError::Cancelled),
            }
        }

        Ok(BufferedResponse {
            status,
            content_type,
            body: Bytes::from(buf),
            latency_ms: started.elapsed().as_millis() as u64,
            eval_count: inspector.eval_count,
            prompt_eval_count: inspector.prompt_eval_count,
        })
    }

    /// Issue a streaming call. Waits for headers plus the first chunk so
    /// that in-stream error payloads (HTTP 200 with an `error` body) still
    /// allow fail-over before the client sees anything.
    pub async fn execute_streaming(
        &self,
        backend: &Backend,
        call: ProxyCall,
    ) -> Result<StreamingResponse, ProxyError> {
        let started = Instant::now();
        let request = self.build_request(backend, &call);
        let mut send_fut = Box::pin(request.send());

        let response = tokio::select! {
            res = &mut send_fut => res.map_err(map_send_error)?,
            _ = tokio::time::sleep(call.budgets.connect) => {
                self.track_unconnected(call.key.clone(), send_fut, started);
                return Err(ProxyError::ConnectTimeout);
            }
            _ = call.cancel.cancelled() => return Err(ProxyError::Cancelled),
        };

        let status = response.status().as_u16();
        let content_type = header_string(&response, "content-type");

        if !(200..300).contains(&status) {
            let body = read_capped_body(response, call.budgets.activity).await;
            return Err(ProxyError::UpstreamStatus {
                status,
                message: extract_error_message(&body),
            });
        }

        let mut stream = Box::pin(response.bytes_stream());

        // Peek at the first chunk before committing the response.
        let first_chunk = tokio::select! {
            next = stream.next() => match next {
                None => None,
                Some(Ok(chunk)) => Some(chunk),
                Some(Err(e)) => return Err(ProxyError::Network(e.to_string())),
            },
            _ = tokio::time::sleep(call.budgets.activity) => {
                self.track_stalled(call.key.clone(), stream, started);
                return Err(ProxyError::ActivityTimeout);
            }
            _ = call.cancel.cancelled() => return Err(ProxyError::Cancelled),
        };

        if let Some(chunk) = &first_chunk {
            if let Some(message) = embedded_error(chunk) {
                return Err(ProxyError::UpstreamStatus {
                    status: 200,
                    message,
                });
            }
        }

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let body = self.forward_stream(call, started, first_chunk, stream, outcome_tx);
        Ok(StreamingResponse {
            status,
            content_type,
            body,
            outcome: outcome_rx,
        })
    }

    /// Build the forwarded stream. The outcome guard reports exactly once:
    /// on clean completion, on failure, or from `Drop` when the client
    /// disconnects first.
    fn forward_stream(
        &self,
        call: ProxyCall,
        started: Instant,
        first_chunk: Option<Bytes>,
        mut upstream: BoxStream<'static, reqwest::Result<Bytes>>,
        outcome_tx: oneshot::Sender<StreamOutcome>,
    ) -> BoxStream<'static, Result<Bytes, std::io::Error>> {
        let client = self.clone();
        let activity = call.budgets.activity;
        let cancel = call.cancel.clone();
        let key = call.key.clone();

        enum Step {
            Chunk(Bytes),
            Done,
            Fail(StreamFailure),
        }

        let stream = async_stream::stream! {
            let mut guard = OutcomeGuard::new(outcome_tx);
            let mut inspector = ChunkInspector::new();

            if let Some(chunk) = first_chunk {
                let signals = inspector.feed(&chunk);
                guard.observe(&inspector, signals, started);
                yield Ok(chunk);
            }

            let mut stalled = false;
            loop {
                let step = tokio::select! {
                    next = upstream.next() => match next {
                        None => Step::Done,
                        Some(Ok(chunk)) => Step::Chunk(chunk),
                        Some(Err(e)) => Step::Fail(StreamFailure::Upstream(e.to_string())),
                    },
                    _ = tokio::time::sleep(activity) => Step::Fail(StreamFailure::ActivityTimeout),
                    _ = cancel.cancelled() => Step::Fail(StreamFailure::Cancelled),
                };
                match step {
                    Step::Chunk(chunk) => {
                        let signals = inspector.feed(&chunk);
                        guard.observe(&inspector, signals, started);
                        yield Ok(chunk);
                    }
                    Step::Done => {
                        guard.finish(Ok(()), started, &inspector);
                        break;
                    }
                    Step::Fail(failure) => {
                        // The response already started: end it cleanly, no
                        // in-band error injection.
                        match &failure {
                            StreamFailure::ActivityTimeout => {
                                tracing::warn!(pair = %key, "Upstream stalled mid-stream");
                                stalled = true;
                            }
                            StreamFailure::Upstream(e) => {
                                tracing::warn!(pair = %key, error = %e, "Upstream errored mid-stream");
                            }
                            StreamFailure::Cancelled => {}
                        }
                        guard.finish(Err(failure), started, &inspector);
                        break;
                    }
                }
            }
            if stalled {
                client.track_stalled(key, upstream, started);
            }
        };
        stream.boxed()
    }

    /// Keep awaiting a connection that timed out client-side, purely to
    /// learn how long the backend actually takes.
    fn track_unconnected(
        &self,
        key: PairKey,
        send_fut: std::pin::Pin<
            Box<dyn std::future::Future<Output = reqwest::Result<reqwest::Response>> + Send>,
        >,
        started: Instant,
    ) {
        if !self.background_tracking {
            return;
        }
        let tx = self.background_tx.clone();
        let listen = self.background_listen;
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(listen, async move {
                let response = send_fut.await.ok()?;
                drain_stream(Box::pin(response.bytes_stream())).await;
                Some(())
            })
            .await;
            let completed = matches!(outcome, Ok(Some(())));
            let _ = tx.send(BackgroundObservation {
                key,
                duration_ms: started.elapsed().as_millis() as u64,
                completed,
            });
        });
    }

    /// Same, for a stream that stalled after headers.
    fn track_stalled(
        &self,
        key: PairKey,
        stream: BoxStream<'static, reqwest::Result<Bytes>>,
        started: Instant,
    ) {
        if !self.background_tracking {
            return;
        }
        let tx = self.background_tx.clone();
        let listen = self.background_listen;
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(listen, drain_stream(stream)).await;
            let _ = tx.send(BackgroundObservation {
                key,
                duration_ms: started.elapsed().as_millis() as u64,
                completed: outcome.is_ok(),
            });
        });
    }
}

async fn drain_stream(mut stream: BoxStream<'static, reqwest::Result<Bytes>>) {
    while let Some(item) = stream.next().await {
        if item.is_err() {
            break;
        }
    }
}

fn map_send_error(e: reqwest::Error) -> ProxyError {
    if e.is_timeout() || e.is_connect() {
        ProxyError::Network(format!("connection failed: {e}"))
    } else {
        ProxyError::Network(e.to_string())
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

async fn read_capped_body(response: reqwest::Response, budget: Duration) -> Vec<u8> {
    let fut = async {
        let mut stream = Box::pin(response.bytes_stream());
        let mut buf = Vec::new();
        while let Some(Ok(chunk)) = stream.next().await {
            buf.extend_from_slice(&chunk);
            if buf.len() >= ERROR_BODY_CAP {
                break;
            }
        }
        buf
    };
    tokio::time::timeout(budget, fut).await.unwrap_or_default()
}

/// Reports the stream outcome exactly once. A drop before `finish` means
/// the client disconnected mid-stream.
struct OutcomeGuard {
    tx: Option<oneshot::Sender<StreamOutcome>>,
    outcome: StreamOutcome,
}

impl OutcomeGuard {
    fn new(tx: oneshot::Sender<StreamOutcome>) -> Self {
        Self {
            tx: Some(tx),
            outcome: StreamOutcome {
                result: Err(StreamFailure::Cancelled),
                ttft_ms: None,
                duration_ms: 0,
                eval_count: None,
                prompt_eval_count: None,
                client_disconnected: true,
            },
        }
    }

    /// Fold in per-chunk observations; TTFT latches on the first chunk with
    /// visible content.
    fn observe(&mut self, inspector: &ChunkInspector, signals: ChunkSignals, started: Instant) {
        if signals.content_started && self.outcome.ttft_ms.is_none() {
            self.outcome.ttft_ms = Some(started.elapsed().as_millis() as u64);
        }
        self.outcome.eval_count = inspector.eval_count;
        self.outcome.prompt_eval_count = inspector.prompt_eval_count;
    }

    fn finish(
        &mut self,
        result: Result<(), StreamFailure>,
        started: Instant,
        inspector: &ChunkInspector,
    ) {
        self.outcome.result = result;
        self.outcome.duration_ms = started.elapsed().as_millis() as u64;
        self.outcome.eval_count = inspector.eval_count;
        self.outcome.prompt_eval_count = inspector.prompt_eval_count;
        self.outcome.client_disconnected = false;
        self.send();
    }

    fn send(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(self.outcome.clone());
        }
    }
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        self.send();
    }
}

/// What one chunk contributed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkSignals {
    /// This chunk carried the first visible content of the stream.
    pub content_started: bool,
    pub done: bool,
}

/// Incremental NDJSON/SSE chunk parser.
///
/// Chunks may split JSON lines arbitrarily; bytes accumulate until a
/// newline completes a line. Metadata parse failures never fail the
/// request.
#[derive(Debug, Default)]
pub struct ChunkInspector {
    pending: Vec<u8>,
    saw_content: bool,
    pub done: bool,
    pub eval_count: Option<u64>,
    pub prompt_eval_count: Option<u64>,
}

impl ChunkInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> ChunkSignals {
        let mut signals = ChunkSignals::default();
        self.pending.extend_from_slice(chunk);

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let Ok(text) = std::str::from_utf8(&line) else {
                continue;
            };
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            // OpenAI-compatible streams frame lines as SSE events.
            let payload = trimmed.strip_prefix("data:").map(str::trim).unwrap_or(trimmed);
            if payload == "[DONE]" {
                self.done = true;
                signals.done = true;
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
                continue;
            };
            self.inspect_value(&value, &mut signals);
        }
        signals
    }

    fn inspect_value(&mut self, value: &serde_json::Value, signals: &mut ChunkSignals) {
        let has_content = visible_content(value);
        if has_content && !self.saw_content {
            self.saw_content = true;
            signals.content_started = true;
        }
        if value.get("done").and_then(|v| v.as_bool()) == Some(true) {
            self.done = true;
            signals.done = true;
        }
        if let Some(n) = value.get("eval_count").and_then(|v| v.as_u64()) {
            self.eval_count = Some(n);
        }
        if let Some(n) = value.get("prompt_eval_count").and_then(|v| v.as_u64()) {
            self.prompt_eval_count = Some(n);
        }
        if let Some(usage) = value.get("usage") {
            if let Some(n) = usage.get("completion_tokens").and_then(|v| v.as_u64()) {
                self.eval_count = Some(n);
            }
            if let Some(n) = usage.get("prompt_tokens").and_then(|v| v.as_u64()) {
                self.prompt_eval_count = Some(n);
            }
        }
    }
}

/// Whether a parsed chunk carries real generated content, as opposed to
/// HTTP framing, role preambles or load notices.
fn visible_content(value: &serde_json::Value) -> bool {
    if let Some(s) = value.get("response").and_then(|v| v.as_str()) {
        if !s.is_empty() {
            return true;
        }
    }
    if let Some(s) = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
    {
        if !s.is_empty() {
            return true;
        }
    }
    if let Some(choices) = value.get("choices").and_then(|v| v.as_array()) {
        for choice in choices {
            let delta_content = choice
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(|v| v.as_str());
            let text = choice.get("text").and_then(|v| v.as_str());
            if delta_content.map_or(false, |s| !s.is_empty())
                || text.map_or(false, |s| !s.is_empty())
            {
                return true;
            }
        }
    }
    false
}

/// Whether a chunk is an error payload smuggled inside an HTTP 200 stream.
fn embedded_error(chunk: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(chunk).ok()?;
    for line in text.lines() {
        let payload = line.trim().strip_prefix("data:").map(str::trim).unwrap_or(line.trim());
        if payload.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
            continue;
        };
        if value.get("error").is_some() {
            return Some(extract_error_message(payload.as_bytes()));
        }
        // Any parsed non-error line means a real stream.
        return None;
    }
    None
}

/// Tolerant upstream error extraction: `{error: string}`,
/// `{error: {message}}`, `{message}`, or free text. Truncated for logs.
pub fn extract_error_message(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let message = match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(value) => value
            .get("error")
            .and_then(|e| {
                e.as_str()
                    .map(str::to_string)
                    .or_else(|| e.get("message").and_then(|m| m.as_str()).map(str::to_string))
            })
            .or_else(|| {
                value
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| text.trim().to_string()),
        Err(_) => text.trim().to_string(),
    };
    let mut out = message;
    if out.len() > ERROR_BODY_CAP {
        let mut cut = ERROR_BODY_CAP;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }
    if out.is_empty() {
        "upstream error with empty body".to_string()
    } else {
        out
    }
}
