//! HTTP client for a single provider's chat-completions endpoint
//!
//! One client per provider configuration. Every network call runs under the
//! client's own circuit breaker with a deadline; failures are normalized into
//! the shared error taxonomy before they leave this module. Success, failure,
//! and health-check outcomes are broadcast on a per-instance event channel so
//! observers (logging, metrics) can subscribe without coupling.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::error::{Error, Result, classify_status, classify_transport};
use crate::registry::ProviderConfig;

/// Placeholder returned in place of the real API key by [`ProviderClient::config`]
pub const MASKED_API_KEY: &str = "********";

const USER_AGENT: &str = concat!("switchboard/", env!("CARGO_PKG_VERSION"));

/// Token budget for the fixed health probe
const HEALTH_PROBE_MAX_TOKENS: u32 = 8;

/// Message role on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Per-call overrides merged over the provider configuration
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
}

/// Parsed non-streaming completion
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ChatCompletion {
    /// Concatenated text of all choices
    pub fn text(&self) -> String {
        self.choices
            .iter()
            .filter_map(|c| c.message.content.as_deref())
            .collect()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices.first()?.finish_reason.as_deref()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: CompletionMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Token accounting reported by the provider
#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// One parsed chunk of a streaming response
#[derive(Debug, Clone, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
}

impl StreamChunk {
    /// Text delta carried by this chunk, if any
    pub fn delta_text(&self) -> Option<&str> {
        self.choices.first()?.delta.content.as_deref()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Outcome of a single health probe
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub response_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
    pub details: HealthDetails,
}

/// What was probed, echoed for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct HealthDetails {
    pub api_url: String,
    pub model: String,
}

/// Events broadcast by a client to its subscribers
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Response {
        provider: String,
        model: String,
        usage: Option<Usage>,
    },
    Error {
        provider: String,
        message: String,
    },
    HealthCheck {
        provider: String,
        result: HealthCheckResult,
    },
}

/// Live client configuration: the provider plus health-check cadence
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub provider: ProviderConfig,
    pub health_check_enabled: bool,
    pub health_check_interval_secs: u64,
}

impl From<ProviderConfig> for ClientConfig {
    fn from(provider: ProviderConfig) -> Self {
        Self {
            provider,
            health_check_enabled: false,
            health_check_interval_secs: 30,
        }
    }
}

impl ClientConfig {
    /// Copy with the API key replaced by [`MASKED_API_KEY`]
    pub fn masked(&self) -> Self {
        let mut cfg = self.clone();
        cfg.provider.api_key = MASKED_API_KEY.to_string();
        cfg
    }
}

/// Partial configuration update for [`ProviderClient::update_config`]
#[derive(Debug, Clone, Default)]
pub struct ClientConfigUpdate {
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub system_prompt: Option<String>,
    pub timeout_ms: Option<u64>,
    pub health_check_enabled: Option<bool>,
    pub health_check_interval_secs: Option<u64>,
}

/// Client for one provider's chat-completions endpoint
pub struct ProviderClient {
    http: reqwest::Client,
    config: RwLock<ClientConfig>,
    breaker: CircuitBreaker,
    events: Mutex<Option<broadcast::Sender<ClientEvent>>>,
    last_health: Mutex<Option<HealthCheckResult>>,
    health_token: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("breaker", &self.breaker.name())
            .field("state", &self.breaker.state())
            .finish_non_exhaustive()
    }
}

impl ProviderClient {
    pub fn new(config: impl Into<ClientConfig>) -> Self {
        let config = config.into();
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .expect("Failed to build HTTP client");
        let breaker = CircuitBreaker::with_defaults(format!("provider:{}", config.provider.name));
        let (events, _) = broadcast::channel(64);

        Self {
            http,
            config: RwLock::new(config),
            breaker,
            events: Mutex::new(Some(events)),
            last_health: Mutex::new(None),
            health_token: Mutex::new(None),
        }
    }

    /// Subscribe to this client's events. After [`Self::destroy`] the
    /// returned receiver is already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        match self.events.lock().unwrap().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// This client's circuit breaker
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Configuration snapshot with the API key masked. The raw key is never
    /// returned by this accessor.
    pub async fn config(&self) -> ClientConfig {
        self.config.read().await.masked()
    }

    /// Merge a partial update into the live configuration. Flipping the
    /// health-check flag starts or stops the recurring probe.
    pub async fn update_config(self: &Arc<Self>, update: ClientConfigUpdate) {
        let mut toggled = None;
        {
            let mut cfg = self.config.write().await;
            if let Some(key) = update.api_key {
                cfg.provider.api_key = key;
            }
            if let Some(url) = update.api_url {
                cfg.provider.api_url = url;
            }
            if let Some(model) = update.model {
                cfg.provider.model = model;
            }
            if let Some(temperature) = update.temperature {
                cfg.provider.temperature = temperature;
            }
            if let Some(max_tokens) = update.max_tokens {
                cfg.provider.max_tokens = max_tokens;
            }
            if let Some(top_p) = update.top_p {
                cfg.provider.top_p = top_p;
            }
            if let Some(prompt) = update.system_prompt {
                cfg.provider.system_prompt = Some(prompt);
            }
            if let Some(timeout_ms) = update.timeout_ms {
                cfg.provider.timeout_ms = timeout_ms;
            }
            if let Some(secs) = update.health_check_interval_secs {
                cfg.health_check_interval_secs = secs;
            }
            if let Some(enabled) = update.health_check_enabled
                && enabled != cfg.health_check_enabled
            {
                cfg.health_check_enabled = enabled;
                toggled = Some(enabled);
            }
        }
        match toggled {
            Some(true) => self.start_health_checks(),
            Some(false) => self.stop_health_checks(),
            None => {}
        }
    }

    /// Send one chat-completion request and return the parsed response
    pub async fn send(
        &self,
        messages: &[ChatMessage],
        options: Option<SendOptions>,
    ) -> Result<ChatCompletion> {
        let cfg = self.config.read().await.clone();
        let provider = cfg.provider.name.clone();

        if cfg.provider.api_key.is_empty() {
            let err = Error::Authentication("no API key configured".to_string());
            self.emit(ClientEvent::Error {
                provider,
                message: err.to_string(),
            });
            return Err(err);
        }
        if !self.breaker.can_execute() {
            let err = Error::Api(format!("circuit breaker '{}' is open", self.breaker.name()));
            self.emit(ClientEvent::Error {
                provider,
                message: err.to_string(),
            });
            return Err(err);
        }

        let body = build_request(&cfg.provider, messages, &options.unwrap_or_default(), false);
        let timeout_ms = cfg.provider.timeout_ms;
        debug!(provider = %provider, model = %cfg.provider.model, "sending completion request");

        let outcome = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.post_completion(&cfg, &body),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout_ms)),
        };

        match outcome {
            Ok(completion) => {
                self.breaker.record_success();
                self.emit(ClientEvent::Response {
                    provider,
                    model: if completion.model.is_empty() {
                        cfg.provider.model.clone()
                    } else {
                        completion.model.clone()
                    },
                    usage: completion.usage.clone(),
                });
                Ok(completion)
            }
            Err(err) => {
                self.breaker.record_failure();
                warn!(provider = %provider, "completion request failed: {err}");
                self.emit(ClientEvent::Error {
                    provider,
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Send a streaming chat-completion request, invoking `on_chunk` for
    /// every parsed chunk. A `data: [DONE]` line ends the stream cleanly;
    /// malformed chunks are logged and skipped.
    pub async fn send_streaming<F>(
        &self,
        messages: &[ChatMessage],
        mut on_chunk: F,
        options: Option<SendOptions>,
    ) -> Result<()>
    where
        F: FnMut(StreamChunk),
    {
        let cfg = self.config.read().await.clone();
        let provider = cfg.provider.name.clone();

        if cfg.provider.api_key.is_empty() {
            let err = Error::Authentication("no API key configured".to_string());
            self.emit(ClientEvent::Error {
                provider,
                message: err.to_string(),
            });
            return Err(err);
        }
        if !self.breaker.can_execute() {
            let err = Error::Api(format!("circuit breaker '{}' is open", self.breaker.name()));
            self.emit(ClientEvent::Error {
                provider,
                message: err.to_string(),
            });
            return Err(err);
        }

        let body = build_request(&cfg.provider, messages, &options.unwrap_or_default(), true);
        let timeout_ms = cfg.provider.timeout_ms;
        debug!(provider = %provider, model = %cfg.provider.model, "sending streaming request");

        let outcome = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.stream_completion(&cfg, &body, &mut on_chunk),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout_ms)),
        };

        match outcome {
            Ok(()) => {
                self.breaker.record_success();
                self.emit(ClientEvent::Response {
                    provider,
                    model: cfg.provider.model.clone(),
                    usage: None,
                });
                Ok(())
            }
            Err(err) => {
                self.breaker.record_failure();
                warn!(provider = %provider, "streaming request failed: {err}");
                self.emit(ClientEvent::Error {
                    provider,
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Probe the provider with a minimal fixed message. Never fails: all
    /// failure detail is folded into the result.
    pub async fn health_check(&self) -> HealthCheckResult {
        let cfg = self.config.read().await.clone();
        let started = Instant::now();

        let outcome = if cfg.provider.api_key.is_empty() {
            Err(Error::Authentication("no API key configured".to_string()))
        } else {
            let options = SendOptions {
                max_tokens: Some(HEALTH_PROBE_MAX_TOKENS),
                ..SendOptions::default()
            };
            let body = build_request(&cfg.provider, &[ChatMessage::user("ping")], &options, false);
            match tokio::time::timeout(
                Duration::from_millis(cfg.provider.timeout_ms),
                self.post_completion(&cfg, &body),
            )
            .await
            {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(Error::Timeout(cfg.provider.timeout_ms)),
            }
        };

        let result = HealthCheckResult {
            healthy: outcome.is_ok(),
            response_time_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
            error: outcome.err().map(|e| e.to_string()),
            details: HealthDetails {
                api_url: cfg.provider.api_url.clone(),
                model: cfg.provider.model.clone(),
            },
        };

        *self.last_health.lock().unwrap() = Some(result.clone());
        self.emit(ClientEvent::HealthCheck {
            provider: cfg.provider.name.clone(),
            result: result.clone(),
        });
        result
    }

    /// Most recent health probe, if any has run
    pub fn last_health_check(&self) -> Option<HealthCheckResult> {
        self.last_health.lock().unwrap().clone()
    }

    /// Start the recurring health probe. The first check runs immediately;
    /// starting again cancels the previous timer first.
    pub fn start_health_checks(self: &Arc<Self>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.health_token.lock().unwrap().replace(token.clone()) {
            previous.cancel();
        }
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let interval_secs = client
                .config
                .read()
                .await
                .health_check_interval_secs
                .max(1);
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("health checks stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let result = client.health_check().await;
                        debug!(
                            healthy = result.healthy,
                            response_time_ms = result.response_time_ms,
                            "health check completed"
                        );
                    }
                }
            }
        });
    }

    /// Cancel the recurring health probe, if one is running
    pub fn stop_health_checks(&self) {
        if let Some(token) = self.health_token.lock().unwrap().take() {
            token.cancel();
        }
    }

    /// Stop background work and drop all event subscribers. The client must
    /// not be used afterward.
    pub fn destroy(&self) {
        self.stop_health_checks();
        self.events.lock().unwrap().take();
        debug!(breaker = %self.breaker.name(), "client destroyed");
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref()
            && tx.receiver_count() > 0
        {
            let _ = tx.send(event);
        }
    }

    async fn post_completion(&self, cfg: &ClientConfig, body: &Value) -> Result<ChatCompletion> {
        let response = self
            .http
            .post(&cfg.provider.api_url)
            .header("Authorization", format!("Bearer {}", cfg.provider.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(&e, cfg.provider.timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(classify_status(status, &text));
        }

        response
            .json::<ChatCompletion>()
            .await
            .map_err(|e| Error::Api(format!("failed to parse completion response: {e}")))
    }

    async fn stream_completion<F>(
        &self,
        cfg: &ClientConfig,
        body: &Value,
        on_chunk: &mut F,
    ) -> Result<()>
    where
        F: FnMut(StreamChunk),
    {
        let response = self
            .http
            .post(&cfg.provider.api_url)
            .header("Authorization", format!("Bearer {}", cfg.provider.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(&e, cfg.provider.timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(classify_status(status, &text));
        }

        let mut stream = response.bytes_stream();
        let mut buf = String::new();
        while let Some(item) = stream.next().await {
            let bytes = item.map_err(|e| classify_transport(&e, cfg.provider.timeout_ms))?;
            buf.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buf.find('\n') {
                let line: String = buf.drain(..=pos).collect();
                match parse_stream_line(line.trim()) {
                    StreamLine::Done => return Ok(()),
                    StreamLine::Chunk(chunk) => on_chunk(chunk),
                    StreamLine::Skip => {}
                }
            }
        }
        Ok(())
    }
}

/// Build the wire request: system prompt injected when configured, per-call
/// options merged over the provider defaults
fn build_request(
    provider: &ProviderConfig,
    messages: &[ChatMessage],
    options: &SendOptions,
    stream: bool,
) -> Value {
    let mut wire: Vec<ChatMessage> = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = &provider.system_prompt
        && !messages.iter().any(|m| m.role == ChatRole::System)
    {
        wire.push(ChatMessage::system(system.clone()));
    }
    wire.extend_from_slice(messages);

    serde_json::json!({
        "model": options.model.as_deref().unwrap_or(&provider.model),
        "messages": wire,
        "max_tokens": options.max_tokens.unwrap_or(provider.max_tokens),
        "temperature": options.temperature.unwrap_or(provider.temperature),
        "top_p": options.top_p.unwrap_or(provider.top_p),
        "stream": stream,
    })
}

enum StreamLine {
    Chunk(StreamChunk),
    Done,
    Skip,
}

/// Parse one line of a server-sent-events body
fn parse_stream_line(line: &str) -> StreamLine {
    if line.is_empty() {
        return StreamLine::Skip;
    }
    let Some(payload) = line.strip_prefix("data:") else {
        return StreamLine::Skip;
    };
    let payload = payload.trim_start();
    if payload == "[DONE]" {
        return StreamLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => StreamLine::Chunk(chunk),
        Err(e) => {
            warn!("skipping malformed stream chunk: {e}");
            StreamLine::Skip
        }
    }
}
