//! Structured-output calls against model vendors.
//!
//! Every call is paced by the rate gate, bounded by per-vendor and global
//! concurrency slots, constrained by a schema directive, screened for
//! degenerate output, and retried with adjusted sampling or routed to the
//! next vendor by health score.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::config::VendorConfig;
use super::degeneration;
use super::health::{CallSample, VendorHealth, SCORE_FLOOR};
use crate::rate_limit::{BucketConfig, GateError, RateGate};

/// How long a caller may wait on the rate gate before giving up.
const GATE_WAIT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("timeout")]
    Timeout,
    #[error("rate_limited")]
    RateLimited,
    #[error("schema_violation: {0}")]
    SchemaViolation(String),
    #[error("degeneration: {0}")]
    Degeneration(&'static str),
    #[error("all vendors exhausted")]
    Exhausted,
    #[error("no vendor above the health floor")]
    NoHealthyVendor,
}

/// One chat message sent to a vendor.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

/// Per-call settings. Sampling starts conservative and is raised on
/// degeneration retries.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Estimated input size, used to derive the output budget.
    pub input_tokens: u32,
    pub temperature: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub request_timeout: Duration,
}

impl CallContext {
    pub fn for_input(input_tokens: u32) -> Self {
        Self {
            input_tokens,
            temperature: 0.1,
            presence_penalty: 0.3,
            frequency_penalty: 0.4,
            request_timeout: Duration::from_secs(120),
        }
    }

    /// Sampling adjustment applied after a degenerate or non-conforming
    /// output: nudge the decoder off the loop it fell into.
    fn adjusted_for_retry(&self) -> Self {
        Self {
            temperature: 0.2,
            presence_penalty: 0.6,
            frequency_penalty: 0.8,
            ..self.clone()
        }
    }
}

/// Output-token cap derived from input size. Small inputs get a tight cap
/// so a degenerate run on a near-empty page cannot burn the vendor budget.
pub fn adaptive_output_budget(input_tokens: u32, vendor_max: u32) -> u32 {
    if input_tokens < 3_000 {
        1_200.min(vendor_max)
    } else if input_tokens <= 8_000 {
        2_000.min(vendor_max)
    } else {
        vendor_max
    }
}

struct VendorState {
    config: VendorConfig,
    slots: Semaphore,
    health: Mutex<VendorHealth>,
}

/// Shared structured-output caller for all model consumers.
pub struct StructuredCaller {
    vendors: Vec<Arc<VendorState>>,
    global_slots: Arc<Semaphore>,
    gate: Arc<RateGate>,
    client: reqwest::Client,
}

impl StructuredCaller {
    pub fn new(vendors: Vec<VendorConfig>, hard_cap: usize, gate: Arc<RateGate>) -> Self {
        for vendor in &vendors {
            gate.set_vendor_config(
                &vendor.name,
                BucketConfig {
                    rate_per_sec: vendor.requests_per_sec,
                    burst: vendor.burst,
                },
            );
        }
        let vendors = vendors
            .into_iter()
            .map(|config| {
                let slots = Semaphore::new(config.max_concurrent);
                Arc::new(VendorState {
                    config,
                    slots,
                    health: Mutex::new(VendorHealth::new()),
                })
            })
            .collect();
        Self {
            vendors,
            global_slots: Arc::new(Semaphore::new(hard_cap.max(1))),
            gate,
            client: reqwest::Client::new(),
        }
    }

    /// Current health score per vendor, in configured priority order.
    pub fn health_scores(&self) -> Vec<(String, f64)> {
        self.vendors
            .iter()
            .map(|v| {
                let score = v.health.lock().expect("vendor health poisoned").score();
                (v.config.name.clone(), score)
            })
            .collect()
    }

    /// Run a structured call and parse the result into `T`.
    ///
    /// Vendors are tried in health order; a vendor below the score floor is
    /// skipped. Within a vendor, transport errors back off, degenerate
    /// outputs retry immediately with adjusted sampling, and a
    /// non-conforming output gets exactly one adjusted retry before the
    /// vendor is given up on.
    pub async fn call<T: DeserializeOwned>(
        &self,
        messages: &[ChatMessage],
        schema: &Value,
        ctx: CallContext,
    ) -> Result<T, LlmError> {
        let ordered = self.vendors_by_health();
        if ordered.is_empty() {
            return Err(LlmError::NoHealthyVendor);
        }

        let mut last_error = LlmError::Exhausted;
        for vendor in ordered {
            match self.call_vendor(&vendor, messages, schema, &ctx).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        "vendor {} exhausted its attempts: {}",
                        vendor.config.name, e
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Vendors at or above the health floor, best score first. Priority
    /// order breaks ties, so the primary wins while both are healthy.
    fn vendors_by_health(&self) -> Vec<Arc<VendorState>> {
        let mut scored: Vec<(f64, Arc<VendorState>)> = self
            .vendors
            .iter()
            .map(|v| {
                let score = v.health.lock().expect("vendor health poisoned").score();
                (score, v.clone())
            })
            .filter(|(score, _)| *score >= SCORE_FLOOR)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, v)| v).collect()
    }

    async fn call_vendor<T: DeserializeOwned>(
        &self,
        vendor: &VendorState,
        messages: &[ChatMessage],
        schema: &Value,
        ctx: &CallContext,
    ) -> Result<T, LlmError> {
        let mut ctx = ctx.clone();
        let mut backoff = Duration::from_millis(500);
        let mut last_error = LlmError::Exhausted;
        // A non-conforming output earns one adjusted retry; a second
        // consecutive one means this vendor will not produce the shape.
        let mut schema_retry_spent = false;

        for attempt in 1..=vendor.config.attempts {
            match self.attempt(vendor, messages, schema, &ctx).await {
                Ok(value) => return Ok(value),
                Err(e @ LlmError::SchemaViolation(_)) => {
                    if schema_retry_spent {
                        debug!(
                            "vendor {} attempt {}: {}, deferring to fallback",
                            vendor.config.name, attempt, e
                        );
                        return Err(e);
                    }
                    debug!(
                        "vendor {} attempt {}: {}, one retry with adjusted sampling",
                        vendor.config.name, attempt, e
                    );
                    schema_retry_spent = true;
                    ctx = ctx.adjusted_for_retry();
                    last_error = e;
                }
                Err(e @ LlmError::Degeneration(_)) => {
                    debug!(
                        "vendor {} attempt {}: {}, retrying with adjusted sampling",
                        vendor.config.name, attempt, e
                    );
                    schema_retry_spent = false;
                    ctx = ctx.adjusted_for_retry();
                    last_error = e;
                    // No delay: the output was wrong, not the transport.
                }
                Err(e @ (LlmError::Transport(_) | LlmError::Timeout | LlmError::RateLimited)) => {
                    debug!(
                        "vendor {} attempt {}: {}, backing off {:?}",
                        vendor.config.name, attempt, e, backoff
                    );
                    schema_retry_spent = false;
                    last_error = e;
                    if attempt < vendor.config.attempts {
                        let jitter = rand::rng().random_range(0.9..=1.1);
                        tokio::time::sleep(backoff.mul_f64(jitter)).await;
                        backoff = (backoff * 2).min(Duration::from_secs(15));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        vendor: &VendorState,
        messages: &[ChatMessage],
        schema: &Value,
        ctx: &CallContext,
    ) -> Result<T, LlmError> {
        // One global and one vendor slot for the duration of the call.
        let _global = self
            .global_slots
            .clone()
            .acquire_owned()
            .await
            .expect("global slot semaphore closed");
        let _slot = vendor
            .slots
            .acquire()
            .await
            .expect("vendor slot semaphore closed");

        if let Err(GateError::TimedOut) = self
            .gate
            .acquire(&vendor.config.name, "chat", 1.0, GATE_WAIT)
            .await
        {
            self.record(vendor, false, true, Duration::ZERO);
            return Err(LlmError::RateLimited);
        }

        let body = build_request(&vendor.config, messages, schema, ctx);
        let started = Instant::now();

        let mut request = self
            .client
            .post(vendor.config.chat_url())
            .timeout(ctx.request_timeout)
            .json(&body);
        if let Some(ref key) = vendor.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                self.record(vendor, false, false, started.elapsed());
                return Err(LlmError::Timeout);
            }
            Err(e) => {
                self.record(vendor, false, false, started.elapsed());
                return Err(LlmError::Transport(e.to_string()));
            }
        };

        let status = response.status();
        if status.as_u16() == 429 {
            self.record(vendor, false, true, started.elapsed());
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            self.record(vendor, false, false, started.elapsed());
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Transport(format!("http {status}: {body}")));
        }

        let payload: ChatResponse = match response.json().await {
            Ok(payload) => payload,
            Err(e) => {
                self.record(vendor, false, false, started.elapsed());
                return Err(LlmError::Transport(e.to_string()));
            }
        };
        let latency = started.elapsed();

        let content = payload
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        if let Some(kind) = degeneration::detect(&content) {
            self.record(vendor, false, false, latency);
            return Err(LlmError::Degeneration(kind.as_str()));
        }

        match serde_json::from_str::<T>(clean_json_payload(&content)) {
            Ok(value) => {
                self.record(vendor, true, false, latency);
                Ok(value)
            }
            Err(e) => {
                self.record(vendor, false, false, latency);
                Err(LlmError::SchemaViolation(e.to_string()))
            }
        }
    }

    fn record(&self, vendor: &VendorState, success: bool, rate_limited: bool, latency: Duration) {
        vendor
            .health
            .lock()
            .expect("vendor health poisoned")
            .record(CallSample {
                success,
                rate_limited,
                latency,
            });
    }
}

#[derive(Debug, serde::Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, serde::Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, serde::Deserialize)]
struct ChatResponseMessage {
    content: String,
}

fn build_request(
    config: &VendorConfig,
    messages: &[ChatMessage],
    schema: &Value,
    ctx: &CallContext,
) -> Value {
    let budget = adaptive_output_budget(ctx.input_tokens, config.max_output_tokens);

    let mut rendered: Vec<Value> = messages
        .iter()
        .map(|m| json!({ "role": m.role, "content": m.content }))
        .collect();

    let mut body = json!({
        "model": config.model,
        "max_tokens": budget,
        "temperature": ctx.temperature,
    });

    if config.supports_sampling {
        body["presence_penalty"] = json!(ctx.presence_penalty);
        body["frequency_penalty"] = json!(ctx.frequency_penalty);
    }

    if config.supports_schema {
        // The schema travels only as a structured-output directive.
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": { "name": "result", "strict": true, "schema": schema }
        });
    } else {
        // Vendors without structured output get the schema in the prompt
        // and rely on post-parse validation.
        rendered.push(json!({
            "role": "system",
            "content": format!(
                "Responda somente com um objeto JSON válido que satisfaça este JSON Schema:\n{}",
                schema
            ),
        }));
    }

    body["messages"] = Value::Array(rendered);
    body
}

/// Strip markdown code fences some models wrap around JSON payloads.
fn clean_json_payload(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vendor(name: &str) -> VendorConfig {
        VendorConfig {
            name: name.to_string(),
            endpoint: format!("http://{name}:8000"),
            model: "test-model".to_string(),
            api_key: None,
            max_concurrent: 4,
            max_output_tokens: 4096,
            supports_schema: true,
            supports_sampling: true,
            attempts: 3,
            requests_per_sec: 10.0,
            burst: 10.0,
        }
    }

    fn caller(vendors: Vec<VendorConfig>) -> StructuredCaller {
        StructuredCaller::new(vendors, 32, Arc::new(RateGate::new(BucketConfig::default())))
    }

    #[test]
    fn test_adaptive_output_budget() {
        assert_eq!(adaptive_output_budget(500, 8192), 1200);
        assert_eq!(adaptive_output_budget(2_999, 8192), 1200);
        assert_eq!(adaptive_output_budget(3_000, 8192), 2000);
        assert_eq!(adaptive_output_budget(8_000, 8192), 2000);
        assert_eq!(adaptive_output_budget(8_001, 8192), 8192);
        // The vendor ceiling always wins.
        assert_eq!(adaptive_output_budget(500, 1000), 1000);
    }

    #[test]
    fn test_adjusted_sampling_for_retry() {
        let ctx = CallContext::for_input(1000);
        assert_eq!(ctx.temperature, 0.1);
        let retry = ctx.adjusted_for_retry();
        assert_eq!(retry.temperature, 0.2);
        assert_eq!(retry.presence_penalty, 0.6);
        assert_eq!(retry.frequency_penalty, 0.8);
        assert_eq!(retry.input_tokens, ctx.input_tokens);
    }

    #[test]
    fn test_schema_travels_as_directive_not_prompt() {
        let config = vendor("primary");
        let messages = [ChatMessage::user("texto")];
        let schema = json!({"type": "object"});
        let body = build_request(&config, &messages, &schema, &CallContext::for_input(100));

        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_schema_in_prompt_fallback() {
        let mut config = vendor("primary");
        config.supports_schema = false;
        config.supports_sampling = false;
        let messages = [ChatMessage::user("texto")];
        let schema = json!({"type": "object"});
        let body = build_request(&config, &messages, &schema, &CallContext::for_input(100));

        assert!(body.get("response_format").is_none());
        assert!(body.get("presence_penalty").is_none());
        let rendered = body["messages"].as_array().unwrap();
        assert_eq!(rendered.len(), 2);
        assert!(rendered[1]["content"]
            .as_str()
            .unwrap()
            .contains("JSON Schema"));
    }

    #[test]
    fn test_unhealthy_vendor_is_skipped() {
        let caller = caller(vec![vendor("primary"), vendor("secondary")]);

        // Tank the primary's health with rate-limited samples.
        for _ in 0..10 {
            caller.record(&caller.vendors[0], false, true, Duration::ZERO);
        }

        let ordered = caller.vendors_by_health();
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].config.name, "secondary");
    }

    #[test]
    fn test_healthy_vendors_keep_priority_order() {
        let caller = caller(vec![vendor("primary"), vendor("secondary")]);
        let ordered = caller.vendors_by_health();
        assert_eq!(ordered[0].config.name, "primary");
        assert_eq!(ordered[1].config.name, "secondary");
    }

    #[test]
    fn test_clean_json_payload() {
        assert_eq!(clean_json_payload("{\"a\": 1}"), "{\"a\": 1}");
        assert_eq!(clean_json_payload("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(clean_json_payload("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(clean_json_payload("  {\"a\": 1}  "), "{\"a\": 1}");
    }
}
