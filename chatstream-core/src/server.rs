//! Producer side over HTTP: `POST /v1/chat/completions` backed by a [`Generator`].
//!
//! Every request gets its own pump task feeding a bounded channel. The
//! streamed response body drains that channel frame by frame; the
//! non-streamed response folds the same events through a [`Reassembler`].
//! Dropping the channel receiver (client gone) cancels generation.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::stream::{self, StreamExt};
use http::{header, HeaderMap, StatusCode};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info, info_span, Span};
use tracing_futures::Instrument;

use crate::client::COMPLETIONS_PATH;
use crate::config::Config;
use crate::encoder::{pump, Emission};
use crate::error::{ChatStreamError, CoreResult, StreamError};
use crate::framer::{self, encode_frame, keepalive_frame};
use crate::generator::{EchoGenerator, FragmentStream, Generator};
use crate::model::{ChatCompletion, CompletionRequest, ErrorBody};
use crate::normalizer::normalize_request;
use crate::reassembly::Reassembler;
use crate::telemetry::{self, Side, StreamTrace};

#[derive(Clone)]
pub struct AppState {
    generator: Arc<dyn Generator>,
    cfg: Arc<Config>,
}

impl AppState {
    pub fn new(generator: Arc<dyn Generator>, cfg: Config) -> Self {
        Self {
            generator,
            cfg: Arc::new(cfg),
        }
    }

    /// State backed by the built-in echo engine.
    pub fn echo(cfg: Config) -> Self {
        let delay = Duration::from_millis(cfg.generator.fragment_delay_ms);
        Self::new(Arc::new(EchoGenerator::new(delay)), cfg)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(COMPLETIONS_PATH, post(completions))
        .with_state(state)
}

/// Serve `state` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> CoreResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, generator = state.generator.name(), "chatstream listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn completions(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let mut req: CompletionRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "invalid_json", e.to_string()),
    };
    if let Err(e) = req.validate() {
        return rejection(&e);
    }
    if req.request_id.is_none() {
        req.request_id = headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }
    let req = normalize_request(req);
    if req.model != state.cfg.generator.model {
        return rejection(&ChatStreamError::Validation(format!(
            "model {:?} is not served here",
            req.model
        )));
    }

    let cancel = CancellationToken::new();
    let fragments = match state.generator.generate(&req, cancel.clone()).await {
        Ok(fragments) => fragments,
        Err(e) => return rejection(&e),
    };

    let (tx, rx) = mpsc::channel(state.cfg.stream.channel_capacity.max(1));
    // pings only make sense on an open event stream
    let keepalive = if req.stream {
        state.cfg.server.keepalive()
    } else {
        None
    };
    spawn_pump(fragments, tx, cancel, keepalive, &req, state.generator.name());

    if req.stream {
        event_stream_response(rx)
    } else {
        folded_response(req.model, rx).await
    }
}

fn spawn_pump(
    fragments: FragmentStream,
    tx: mpsc::Sender<Emission>,
    cancel: CancellationToken,
    keepalive: Option<Duration>,
    req: &CompletionRequest,
    generator: &str,
) {
    let span = info_span!(
        "pump",
        model = %req.model,
        request_id = req.request_id.as_deref().unwrap_or(""),
        generator,
        stream = req.stream,
        outcome = field::Empty,
        events = field::Empty,
    );
    let model = req.model.clone();
    let request_id = req.request_id.clone();
    let started = Instant::now();

    tokio::spawn(
        async move {
            debug!("pump started");
            let report = pump(fragments, tx, cancel, keepalive).await;
            let span = Span::current();
            span.record("outcome", report.outcome.as_str());
            span.record("events", report.events);
            info!(outcome = report.outcome.as_str(), events = report.events, "pump finished");
            telemetry::emit(
                StreamTrace::new(Side::Server)
                    .model(&model)
                    .request_id_opt(request_id.as_deref())
                    .status(report.outcome.as_str())
                    .events(report.events)
                    .latency_ms(started.elapsed().as_millis() as u64),
            );
        }
        .instrument(span),
    );
}

fn event_stream_response(rx: mpsc::Receiver<Emission>) -> Response {
    let frames = receive(rx).map(|emission| match emission {
        Emission::Event(event) => encode_frame(&event),
        Emission::KeepAlive => Ok(keepalive_frame()),
    });
    (
        [
            (header::CONTENT_TYPE, framer::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

async fn folded_response(model: String, mut rx: mpsc::Receiver<Emission>) -> Response {
    let mut state = Reassembler::new();
    while let Some(emission) = rx.recv().await {
        if let Emission::Event(event) = emission {
            state.apply(event);
            if state.status().is_terminal() {
                break;
            }
        }
    }
    if !state.status().is_terminal() {
        state.fail(StreamError::TransportSevered(
            "generation stopped before a terminal event".into(),
        ));
    }

    let done = state.finish();
    Json(ChatCompletion {
        model,
        message: done.message,
        status: done.status,
        error: done.error.map(|e| ErrorBody {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }),
    })
    .into_response()
}

fn receive(rx: mpsc::Receiver<Emission>) -> impl futures::Stream<Item = Emission> + Send {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|em| (em, rx)) })
}

fn rejection(err: &ChatStreamError) -> Response {
    let (status, kind) = match err {
        ChatStreamError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
        ChatStreamError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    error_response(status, kind, err.to_string())
}

fn error_response(status: StatusCode, kind: &str, message: String) -> Response {
    debug!(%status, kind, %message, "request rejected");
    (
        status,
        Json(ErrorBody {
            kind: kind.to_string(),
            message,
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ChatClient;
    use crate::config::{HttpCfg, StreamCfg};
    use crate::model::{Message, StreamStatus, UpstreamError};
    use crate::test_util::ScriptedGenerator;
    use async_trait::async_trait;
    use std::sync::Mutex;

    async fn start(generator: Arc<dyn Generator>, cfg: Config) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(generator, cfg);
        tokio::spawn(async move { serve(listener, state, std::future::pending()).await.unwrap() });
        format!("http://{addr}")
    }

    fn hello() -> CompletionRequest {
        CompletionRequest::new("echo", vec![Message::user("  Hello world!\r\n")])
    }

    /// Remembers the token it was handed so tests can watch for cancellation.
    struct Watched {
        inner: ScriptedGenerator,
        token: Arc<Mutex<Option<CancellationToken>>>,
    }

    #[async_trait]
    impl Generator for Watched {
        fn name(&self) -> &str {
            "watched"
        }

        async fn generate(
            &self,
            req: &CompletionRequest,
            cancel: CancellationToken,
        ) -> CoreResult<FragmentStream> {
            *self.token.lock().unwrap() = Some(cancel.clone());
            self.inner.generate(req, cancel).await
        }
    }

    #[tokio::test]
    async fn streams_echo_end_to_end() {
        let base = start(Arc::new(EchoGenerator::default()), Config::default()).await;
        let client = ChatClient::new_default(base).unwrap();

        let mut h = client.open_stream(hello()).await.unwrap();
        let mut deltas = Vec::new();
        while let Some(update) = h.next().await {
            let update = update.unwrap();
            deltas.push(update.delta);
        }
        assert_eq!(deltas, vec!["Hello ", "world!", ""]);
        assert_eq!(h.status(), StreamStatus::Completed);
        assert_eq!(h.content(), "Hello world!");
    }

    #[tokio::test]
    async fn stream_response_has_event_stream_headers() {
        let base = start(Arc::new(EchoGenerator::default()), Config::default()).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}{COMPLETIONS_PATH}"))
            .json(&hello())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");
        assert_eq!(resp.headers()["cache-control"], "no-cache");
        let body = resp.text().await.unwrap();
        assert!(body.starts_with("data: "));
        assert!(body.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn non_streamed_request_gets_folded_json() {
        let base = start(Arc::new(EchoGenerator::default()), Config::default()).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}{COMPLETIONS_PATH}"))
            .json(&hello().with_stream(false))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: ChatCompletion = resp.json().await.unwrap();
        assert_eq!(body.model, "echo");
        assert_eq!(body.status, StreamStatus::Completed);
        assert_eq!(body.message.content.as_text(), "Hello world!");
        assert!(body.error.is_none());
    }

    #[tokio::test]
    async fn non_streamed_failure_reports_partial_content() {
        let mut script = ScriptedGenerator::new(&["par", "tial"]);
        script.fail = Some(UpstreamError::new("engine", "overloaded"));
        let base = start(Arc::new(script), Config::default()).await;
        let body: ChatCompletion = reqwest::Client::new()
            .post(format!("{base}{COMPLETIONS_PATH}"))
            .json(&hello().with_stream(false))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body.status, StreamStatus::Failed);
        assert_eq!(body.message.content.as_text(), "partial");
        assert_eq!(body.error.unwrap().kind, "upstream");
    }

    #[tokio::test]
    async fn upstream_failure_reaches_streaming_client() {
        let mut script = ScriptedGenerator::new(&["half"]);
        script.fail = Some(UpstreamError::new("engine", "oom"));
        let base = start(Arc::new(script), Config::default()).await;
        let client = ChatClient::new_default(base).unwrap();
        let done = client.complete(hello()).await.unwrap();
        assert_eq!(done.status, StreamStatus::Failed);
        assert_eq!(done.text(), "half");
        assert_eq!(
            done.error,
            Some(StreamError::Upstream(UpstreamError::new("engine", "oom")))
        );
    }

    #[tokio::test]
    async fn empty_messages_are_rejected_with_400() {
        let base = start(Arc::new(EchoGenerator::default()), Config::default()).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}{COMPLETIONS_PATH}"))
            .json(&serde_json::json!({"model": "echo", "messages": [], "stream": true}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: ErrorBody = resp.json().await.unwrap();
        assert_eq!(body.kind, "validation");
    }

    #[tokio::test]
    async fn unknown_model_is_rejected_with_400() {
        let mut cfg = Config::default();
        cfg.generator.model = "programmer".into();
        let base = start(Arc::new(EchoGenerator::default()), cfg).await;
        let http = reqwest::Client::new();

        let resp = http
            .post(format!("{base}{COMPLETIONS_PATH}"))
            .json(&CompletionRequest::new("no-such-model", vec![Message::user("hi")]).with_stream(false))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: ErrorBody = resp.json().await.unwrap();
        assert_eq!(body.kind, "validation");
        assert!(body.message.contains("no-such-model"));

        let resp = http
            .post(format!("{base}{COMPLETIONS_PATH}"))
            .json(&CompletionRequest::new(" programmer ", vec![Message::user("hi")]).with_stream(false))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: ChatCompletion = resp.json().await.unwrap();
        assert_eq!(body.model, "programmer");
        assert_eq!(body.status, StreamStatus::Completed);
    }

    #[tokio::test]
    async fn malformed_json_is_rejected_with_400() {
        let base = start(Arc::new(EchoGenerator::default()), Config::default()).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}{COMPLETIONS_PATH}"))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: ErrorBody = resp.json().await.unwrap();
        assert_eq!(body.kind, "invalid_json");
    }

    #[tokio::test]
    async fn client_cancel_stops_generation() {
        let token = Arc::new(Mutex::new(None));
        let mut inner = ScriptedGenerator::new(&["tick "]);
        inner.hang = true;
        let generator = Watched {
            inner,
            token: token.clone(),
        };
        // frequent pings make the server notice the closed connection
        let mut cfg = Config::default();
        cfg.server.keepalive_ms = 10;
        let base = start(Arc::new(generator), cfg).await;

        let client = ChatClient::new(base, &HttpCfg::default(), StreamCfg::default()).unwrap();
        let mut h = client.open_stream(hello()).await.unwrap();
        assert_eq!(h.next().await.unwrap().unwrap().delta, "tick ");
        assert!(h.cancel());
        assert_eq!(h.status(), StreamStatus::Cancelled);
        drop(h);

        let server_token = token.lock().unwrap().clone().unwrap();
        tokio::time::timeout(Duration::from_secs(5), server_token.cancelled())
            .await
            .expect("server never observed the disconnect");
    }
}
