//! Request dispatch: route, translate, call the backend with credential
//! rotation, translate the answer back.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};

use crate::client::{BackendStream, ProviderClient, Upstream};
use crate::config::ProxyConfig;
use crate::error::{truncate, ProxyError, Result};
use crate::keys::{Credential, KeySelector};
use crate::logging::{AuditRecord, AuditSink};
use crate::routing::{RouteDecision, RouteResolver};
use crate::translate::neutral::{new_id, NeutralRequest, NeutralResponse, StreamEvent};
use crate::translate::streaming::{
    FrameDecoder, FrameMode, SseFrame, StreamDecoder, StreamState, Transcoder,
};
use crate::translate::{self, Format, RouteParams};

/// Status recorded when the client hangs up mid-stream.
const CLIENT_CLOSED_REQUEST: u16 = 499;
const SUMMARY_LEN: usize = 200;

pub type FrameStream = Pin<Box<dyn Stream<Item = SseFrame> + Send>>;
pub type RawStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send>>;

/// What the server sends back for one request.
pub enum DispatchOutput {
    /// Translated non-streaming body.
    Json(serde_json::Value),
    /// Translated stream, in the client's framing.
    Stream(FrameStream),
    /// Direct mode: backend body, untouched.
    Raw { content_type: String, body: Bytes },
    /// Direct mode: backend stream, untouched.
    RawStream { content_type: String, body: RawStream },
}

/// Per-request context shared by every attempt.
#[derive(Debug, Clone)]
struct Call {
    request_id: String,
    source: Format,
    upstream: Upstream,
    /// Model name reported back to the client.
    client_model: String,
    credential_ref: Option<String>,
    request_summary: Option<String>,
}

#[derive(Debug, Default)]
struct Outcome {
    status: u16,
    response_summary: Option<String>,
    error: Option<String>,
}

impl Outcome {
    fn ok(summary: Option<String>) -> Self {
        Self {
            status: 200,
            response_summary: summary,
            error: None,
        }
    }

    fn failed(status: u16, error: String) -> Self {
        Self {
            status,
            response_summary: None,
            error: Some(error),
        }
    }
}

/// A backend call that succeeded, and which attempt/key produced it.
struct Attempt<T> {
    value: T,
    credential: Credential,
    attempt: u32,
    started: Instant,
}

pub struct Dispatcher {
    config: Arc<ProxyConfig>,
    router: Arc<dyn RouteResolver>,
    keys: Arc<dyn KeySelector>,
    audit: Arc<dyn AuditSink>,
    client: ProviderClient,
}

impl Dispatcher {
    pub fn new(
        config: Arc<ProxyConfig>,
        router: Arc<dyn RouteResolver>,
        keys: Arc<dyn KeySelector>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let client = ProviderClient::new(Duration::from_secs(config.request_timeout_secs))?;
        Ok(Self {
            config,
            router,
            keys,
            audit,
            client,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Serve one inbound body in `source` format.
    pub async fn handle(&self, source: Format, raw: Bytes) -> Result<DispatchOutput> {
        let mut req = translate::to_neutral(source, &raw)?;
        let decision = self.resolve(source, &req)?;

        let provider = decision.target_provider.clone();
        let target = self.config.provider_format(&provider)?;
        let base_url = match decision.api_base_override {
            Some(ref base) => base.clone(),
            None => self.config.provider_base_url(&provider)?,
        };

        let call = Call {
            request_id: new_id("req_"),
            source,
            upstream: Upstream {
                provider: provider.clone(),
                format: target,
                base_url,
                model: decision.target_model.clone(),
            },
            client_model: req.model.clone(),
            credential_ref: decision.credential_ref.clone(),
            request_summary: req
                .prompt_hint()
                .map(|h| truncate(&h, SUMMARY_LEN).to_string()),
        };

        tracing::info!(
            request_id = %call.request_id,
            source = %source,
            requested_model = %req.model,
            provider = %provider,
            target_model = %decision.target_model,
            stream = req.stream,
            "dispatching request"
        );

        if self.config.direct_mode && target == source {
            let body = passthrough_body(source, raw)?;
            return self.forward(call, body, req.stream).await;
        }

        req.model = decision.target_model;
        let params = RouteParams {
            supports_tools: self.config.provider_supports_tools(&provider),
        };
        let built = translate::build_request(target, &req, &params)?;
        let body = Bytes::from(serde_json::to_vec(&built.body)?);

        if req.stream {
            self.dispatch_stream(call, body).await
        } else {
            self.dispatch_json(call, body).await
        }
    }

    fn resolve(&self, source: Format, req: &NeutralRequest) -> Result<RouteDecision> {
        let hint = req.prompt_hint();
        if let Some(decision) = self
            .router
            .resolve_route(source, &req.model, hint.as_deref())
        {
            return Ok(decision);
        }

        match self.config.default {
            Some(ref default) => {
                tracing::debug!(model = %req.model, provider = %default.provider, "no route matched, using default");
                Ok(RouteDecision {
                    source_format: source,
                    target_provider: default.provider.clone(),
                    target_model: default.model.clone(),
                    credential_ref: None,
                    api_base_override: None,
                })
            }
            None => Err(ProxyError::RouteNotFound {
                model: req.model.clone(),
            }),
        }
    }

    async fn dispatch_json(&self, call: Call, body: Bytes) -> Result<DispatchOutput> {
        let client = &self.client;
        let upstream = &call.upstream;
        let done = self
            .with_retries(&call, |credential| {
                let body = body.clone();
                async move { client.send(upstream, body, &credential).await }
            })
            .await?;

        let translated = translate::parse_response(upstream.format, &done.value).and_then(|mut resp| {
            resp.model = call.client_model.clone();
            let body = translate::from_neutral(call.source, &resp)?;
            Ok((resp, body))
        });

        let outcome = match translated {
            Ok((ref resp, _)) => Outcome::ok(Some(response_summary(resp))),
            Err(ref e) => Outcome::failed(e.status_code(), e.to_string()),
        };
        self.report(&call, done.attempt, &done.credential.id, done.started.elapsed(), outcome);

        let (resp, body) = translated?;
        tracing::info!(
            request_id = %call.request_id,
            prompt_tokens = resp.usage.prompt_tokens,
            completion_tokens = resp.usage.completion_tokens,
            "completed"
        );
        Ok(DispatchOutput::Json(body))
    }

    async fn dispatch_stream(&self, call: Call, body: Bytes) -> Result<DispatchOutput> {
        let client = &self.client;
        let upstream = &call.upstream;
        let done = self
            .with_retries(&call, |credential| {
                let body = body.clone();
                async move { client.send_stream(upstream, body, &credential).await }
            })
            .await?;

        let idle = Duration::from_secs(self.config.stream_idle_timeout_secs);
        let backend = call.upstream.format;
        let client_format = call.source;
        let model = call.client_model.clone();
        let guard = self.stream_guard(call, &done);
        Ok(DispatchOutput::Stream(transcode(
            backend,
            client_format,
            &model,
            done.value,
            idle,
            guard,
        )))
    }

    /// Direct mode: same format on both sides, bodies are not translated.
    async fn forward(&self, call: Call, body: Bytes, stream: bool) -> Result<DispatchOutput> {
        let client = &self.client;
        let upstream = &call.upstream;

        if stream {
            let done = self
                .with_retries(&call, |credential| {
                    let body = body.clone();
                    async move { client.send_stream(upstream, body, &credential).await }
                })
                .await?;
            let idle = Duration::from_secs(self.config.stream_idle_timeout_secs);
            let content_type = done
                .value
                .content_type
                .clone()
                .unwrap_or_else(|| "text/event-stream".to_string());
            let source = call.source;
            let model = call.client_model.clone();
            let guard = self.stream_guard(call, &done);
            return Ok(DispatchOutput::RawStream {
                content_type,
                body: passthrough_stream(source, &model, done.value, idle, guard),
            });
        }

        let done = self
            .with_retries(&call, |credential| {
                let body = body.clone();
                async move { client.send(upstream, body, &credential).await }
            })
            .await?;
        self.report(
            &call,
            done.attempt,
            &done.credential.id,
            done.started.elapsed(),
            Outcome::ok(None),
        );
        Ok(DispatchOutput::Raw {
            content_type: "application/json".to_string(),
            body: done.value,
        })
    }

    /// Call the backend, rotating credentials on 429 (up to the pool size
    /// or `max_attempts`, whichever is smaller) and once on an auth failure.
    /// Failed attempts are reported here; the caller reports the success.
    async fn with_retries<T, F, Fut>(&self, call: &Call, mut send: F) -> Result<Attempt<T>>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let provider = &call.upstream.provider;
        let pool = self.keys.pool_size(provider);
        if pool == 0 {
            return Err(ProxyError::config(format!(
                "no credentials configured for provider '{provider}'"
            )));
        }
        let limit = pool.min(self.config.max_attempts).max(1) as u32;

        let mut tried: Vec<String> = Vec::new();
        let mut rotated_auth = false;
        let mut last_error = None;

        for attempt in 1..=limit {
            let Some(credential) =
                self.keys
                    .acquire(provider, call.credential_ref.as_deref(), &tried)
            else {
                break;
            };

            let started = Instant::now();
            match send(credential.clone()).await {
                Ok(value) => {
                    return Ok(Attempt {
                        value,
                        credential,
                        attempt,
                        started,
                    })
                }
                Err(err) => {
                    self.report(
                        call,
                        attempt,
                        &credential.id,
                        started.elapsed(),
                        Outcome::failed(err.status_code(), err.client_message()),
                    );

                    let retry = if err.is_rate_limit() {
                        true
                    } else if err.is_authentication() && !rotated_auth {
                        rotated_auth = true;
                        true
                    } else {
                        false
                    };
                    if !retry {
                        return Err(err);
                    }

                    tracing::warn!(
                        request_id = %call.request_id,
                        provider = %provider,
                        key = %credential.id,
                        attempt,
                        error = %err,
                        "rotating credential"
                    );
                    tried.push(credential.id);
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ProxyError::RateLimit {
            provider: provider.clone(),
            body: "no credential available: every key is cooling down".to_string(),
        }))
    }

    fn report(&self, call: &Call, attempt: u32, credential_id: &str, latency: Duration, outcome: Outcome) {
        record_outcome(
            self.keys.as_ref(),
            self.audit.as_ref(),
            call,
            attempt,
            credential_id,
            latency,
            outcome,
        );
    }

    fn stream_guard<T>(&self, call: Call, done: &Attempt<T>) -> StreamGuard {
        StreamGuard {
            keys: Arc::clone(&self.keys),
            audit: Arc::clone(&self.audit),
            call,
            attempt: done.attempt,
            credential_id: done.credential.id.clone(),
            started: done.started,
            outcome: Outcome::failed(CLIENT_CLOSED_REQUEST, "client disconnected".to_string()),
        }
    }
}

fn record_outcome(
    keys: &dyn KeySelector,
    audit: &dyn AuditSink,
    call: &Call,
    attempt: u32,
    credential_id: &str,
    latency: Duration,
    outcome: Outcome,
) {
    // A hang-up says nothing about the key.
    let key_status = if outcome.status == CLIENT_CLOSED_REQUEST {
        200
    } else {
        outcome.status
    };
    keys.report_outcome(&call.upstream.provider, credential_id, key_status, latency);

    audit.audit(AuditRecord {
        timestamp: Utc::now(),
        request_id: call.request_id.clone(),
        attempt,
        source_format: call.source.to_string(),
        target_provider: call.upstream.provider.clone(),
        target_model: call.upstream.model.clone(),
        credential_id: Some(credential_id.to_string()),
        status: outcome.status,
        latency_ms: latency.as_millis() as u64,
        request_summary: call.request_summary.clone(),
        response_summary: outcome.response_summary,
        error: outcome.error,
    });
}

/// Reports a stream's outcome when the stream is dropped, whether it ran to
/// the end or the client went away first.
struct StreamGuard {
    keys: Arc<dyn KeySelector>,
    audit: Arc<dyn AuditSink>,
    call: Call,
    attempt: u32,
    credential_id: String,
    started: Instant,
    outcome: Outcome,
}

impl StreamGuard {
    fn settle(&mut self, outcome: Outcome) {
        self.outcome = outcome;
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let outcome = std::mem::take(&mut self.outcome);
        if outcome.status == CLIENT_CLOSED_REQUEST {
            tracing::info!(request_id = %self.call.request_id, "client disconnected mid-stream");
        }
        record_outcome(
            self.keys.as_ref(),
            self.audit.as_ref(),
            &self.call,
            self.attempt,
            &self.credential_id,
            self.started.elapsed(),
            outcome,
        );
    }
}

fn transcode(
    backend: Format,
    client: Format,
    model: &str,
    upstream: BackendStream,
    idle: Duration,
    mut guard: StreamGuard,
) -> FrameStream {
    let mut transcoder = Transcoder::new(backend, client, model, upstream.content_type.as_deref());
    let mut body = upstream.body;

    Box::pin(async_stream::stream! {
        loop {
            let frames = match tokio::time::timeout(idle, body.next()).await {
                Ok(Some(Ok(bytes))) => transcoder.feed(&bytes),
                Ok(Some(Err(e))) => transcoder.fail(&format!("backend stream error: {e}")),
                Ok(None) => transcoder.close(),
                Err(_) => transcoder.fail(&format!("backend sent nothing for {}s", idle.as_secs())),
            };
            for frame in frames {
                yield frame;
            }
            if transcoder.is_terminated() {
                break;
            }
        }

        let outcome = match transcoder.state() {
            StreamState::Finished => Outcome::ok(Some(format!(
                "finish_reason={:?}{} completion_tokens={}",
                transcoder.finish_reason(),
                transcoder
                    .finish_details()
                    .map(|d| format!("({d})"))
                    .unwrap_or_default(),
                transcoder.usage().map_or(0, |u| u.completion_tokens)
            ))),
            _ => Outcome::failed(
                502,
                transcoder.error().unwrap_or("stream failed").to_string(),
            ),
        };
        guard.settle(outcome);
    })
}

fn passthrough_stream(
    source: Format,
    model: &str,
    upstream: BackendStream,
    idle: Duration,
    mut guard: StreamGuard,
) -> RawStream {
    let mut watch = StreamWatch::new(source, upstream.content_type.as_deref());
    let mut encoder = source.codec().stream_encoder(model);
    let mut body = upstream.body;

    Box::pin(async_stream::stream! {
        let failure = loop {
            match tokio::time::timeout(idle, body.next()).await {
                Ok(Some(Ok(bytes))) => {
                    watch.observe(&bytes);
                    yield Ok::<_, std::io::Error>(bytes);
                }
                Ok(Some(Err(e))) if !watch.ended => break Some(format!("backend stream error: {e}")),
                Err(_) if !watch.ended => {
                    break Some(format!("backend sent nothing for {}s", idle.as_secs()))
                }
                Ok(None) => {
                    watch.close();
                    if !watch.complete() {
                        break Some(
                            "backend closed the stream without an end-of-stream marker".to_string(),
                        );
                    }
                    break None;
                }
                // The backend already sent its end marker; what follows is noise.
                Ok(Some(Err(_))) | Err(_) => break None,
            }
        };

        match (failure, watch.error.take()) {
            (Some(message), _) => {
                tracing::warn!(error = %message, "passthrough stream failed");
                for frame in encoder.fail(&message) {
                    yield Ok(Bytes::from(frame.render()));
                }
                guard.settle(Outcome::failed(502, message));
            }
            // Forwarded as the backend framed it; only the audit needs it.
            (None, Some(backend_error)) => guard.settle(Outcome::failed(502, backend_error)),
            (None, None) => guard.settle(Outcome::ok(None)),
        }
    })
}

/// Follows a stream that is forwarded untranslated, to learn whether the
/// backend ended it properly.
struct StreamWatch {
    frames: FrameDecoder,
    decoder: Box<dyn StreamDecoder>,
    /// The backend sent its end marker or an error event.
    ended: bool,
    error: Option<String>,
}

impl StreamWatch {
    fn new(format: Format, content_type: Option<&str>) -> Self {
        Self {
            frames: FrameDecoder::new(FrameMode::from_content_type(content_type)),
            decoder: format.codec().stream_decoder(),
            ended: false,
            error: None,
        }
    }

    fn observe(&mut self, bytes: &[u8]) {
        match self.frames.push(bytes) {
            Ok(frames) => self.decode(frames),
            Err(e) => tracing::debug!(error = %e, "unreadable passthrough frame"),
        }
    }

    fn close(&mut self) {
        match self.frames.finish() {
            Ok(Some(frame)) => self.decode(vec![frame]),
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "unreadable passthrough frame"),
        }
    }

    fn decode(&mut self, frames: Vec<SseFrame>) {
        for frame in frames {
            match self.decoder.decode(&frame) {
                Ok(events) => {
                    for event in events {
                        match event {
                            StreamEvent::Done => self.ended = true,
                            StreamEvent::Error(message) => {
                                self.ended = true;
                                self.error = Some(message);
                            }
                            _ => {}
                        }
                    }
                }
                Err(e) => tracing::debug!(error = %e, "unparsed passthrough frame"),
            }
        }
    }

    /// Whether the stream, now closed by the backend, was complete.
    fn complete(&self) -> bool {
        self.ended || self.decoder.clean_eof()
    }
}

/// Audit summary of a translated response. A backend finish reason with no
/// equivalent in the client's vocabulary is recorded here.
fn response_summary(resp: &NeutralResponse) -> String {
    let full = resp.text();
    let text = truncate(&full, SUMMARY_LEN);
    match resp.finish_details {
        Some(ref raw) => format!("[finish_reason={raw}] {text}"),
        None => text.to_string(),
    }
}

/// Body forwarded in direct mode. The Gemini inbound shape carries `model`
/// and `stream`, which Google takes from the URL instead.
fn passthrough_body(source: Format, raw: Bytes) -> Result<Bytes> {
    if source != Format::Gemini {
        return Ok(raw);
    }
    let mut value: serde_json::Value = serde_json::from_slice(&raw)
        .map_err(|e| ProxyError::validation(format!("malformed Gemini request: {e}")))?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("model");
        obj.remove("stream");
    }
    Ok(Bytes::from(serde_json::to_vec(&value)?))
}
