use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::config::{HttpCfg, StreamCfg};
use crate::decoder::ByteStream;
use crate::error::{ChatStreamError, CoreResult, StreamError};
use crate::framer::CONTENT_TYPE;
use crate::handle::StreamHandle;
use crate::model::{CompletionRequest, ErrorBody};
use crate::reassembly::Completion;

/// Path of the completion endpoint, relative to the service base URL.
pub const COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Consumer side of the protocol: opens streamed completions against a service.
#[derive(Debug, Clone)]
pub struct ChatClient {
    inner: Client,
    base: String,
    user_agent: String,
    stream_cfg: StreamCfg,
}

impl ChatClient {
    pub fn new(base: impl Into<String>, http: &HttpCfg, stream_cfg: StreamCfg) -> CoreResult<Self> {
        let mut builder =
            Client::builder().connect_timeout(Duration::from_millis(http.connect_timeout_ms));
        // no overall timeout: a stream lives as long as its events keep coming
        if let Some(n) = http.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| ChatStreamError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            base: base.into().trim_end_matches('/').to_string(),
            user_agent: concat!("chatstream/", env!("CARGO_PKG_VERSION")).to_string(),
            stream_cfg,
        })
    }

    pub fn new_default(base: impl Into<String>) -> CoreResult<Self> {
        Self::new(base, &HttpCfg::default(), StreamCfg::default())
    }

    fn url(&self) -> String {
        format!("{}{}", self.base, COMPLETIONS_PATH)
    }

    /// Submit `req` and return a handle over its event stream.
    ///
    /// Errors here mean no stream was established; once a handle is returned
    /// every failure is reported through it.
    pub async fn open_stream(&self, req: CompletionRequest) -> CoreResult<StreamHandle> {
        req.validate()?;
        let req = req.with_stream(true);

        let mut builder = self
            .inner
            .post(self.url())
            .json(&req)
            .header("User-Agent", &self.user_agent)
            .header("Accept", CONTENT_TYPE);
        if let Some(rid) = req.request_id.as_deref() {
            builder = builder.header("X-Request-Id", rid);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| ChatStreamError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error(status, &body));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with(CONTENT_TYPE) {
            return Err(ChatStreamError::Http {
                code: status.as_u16(),
                message: format!("unexpected content-type {content_type:?}"),
            });
        }
        debug!(url = %self.url(), model = %req.model, "stream established");

        let bytes: ByteStream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StreamError::TransportSevered(e.to_string())))
            .boxed();
        Ok(StreamHandle::open(bytes, &self.stream_cfg, &req))
    }

    /// Non-streaming convenience: open the stream and fold it to the end.
    pub async fn complete(&self, req: CompletionRequest) -> CoreResult<Completion> {
        Ok(self.open_stream(req).await?.collect().await)
    }
}

fn map_http_error(status: StatusCode, body: &str) -> ChatStreamError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| truncate(body, 300));
    match status {
        s if s.is_server_error() => ChatStreamError::Unavailable(format!("{} {message}", s.as_u16())),
        s => ChatStreamError::Http {
            code: s.as_u16(),
            message,
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut t = s[..end].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}
