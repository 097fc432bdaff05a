//! AI fallback extractor for free-form order messages.
//!
//! Runs only when every regex strategy failed to find a route. Talks to any
//! OpenAI-compatible chat endpoint; cities it returns are re-validated by
//! the caller, so a hallucinated answer degrades to "no order", never to a
//! bogus notification.
//!
//! Env vars:
//! ```env
//! AI_ENABLED=true
//! AI_API_KEY=sk-...
//! AI_BASE_URL=https://api.openai.com      # default
//! AI_MODEL=gpt-4o-mini                    # default
//! AI_TIMEOUT_MS=8000                      # default
//! ```

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 3;

// ─────────────────────────── System prompt ───────────────────────────────

const SYSTEM_PROMPT: &str = r#"Ты извлекаешь данные заказа междугороднего такси из сообщения в Telegram-группе.

Из текста сообщения определи:
- point_a: город отправления (именительный падеж, например "Уфа")
- point_b: город назначения (именительный падеж)
- price: цена поездки в рублях целым числом, либо null если цена не указана

Правила:
- Улицы, номера домов, время и даты городами не являются.
- Если городов отправления и назначения в тексте нет, верни null в обоих полях.
- Не придумывай города, которых нет в тексте.

Ответь ТОЛЬКО JSON-объектом, без пояснений:
{"point_a": "Уфа", "point_b": "Казань", "price": 15000}
"#;

// ─────────────────────────── Data types ──────────────────────────────────

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    r#type: &'static str,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct AiResult {
    point_a: Option<String>,
    point_b: Option<String>,
    #[serde(default)]
    price: Option<i64>,
}

// ─────────────────────────── AiExtractor ─────────────────────────────────

/// Async route extractor of last resort. Constructed once, reused for every
/// message that defeats the regex strategies.
pub struct AiExtractor {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    enabled: bool,
    timeout: Duration,
}

impl AiExtractor {
    /// Build from environment variables.
    ///
    /// | Env var         | Default                   | Description              |
    /// |-----------------|---------------------------|--------------------------|
    /// | `AI_ENABLED`    | `false`                   | Enable AI fallback       |
    /// | `AI_API_KEY`    | none                      | Bearer token             |
    /// | `AI_BASE_URL`   | `https://api.openai.com`  | OpenAI-compatible server |
    /// | `AI_MODEL`      | `gpt-4o-mini`             | Model name               |
    /// | `AI_TIMEOUT_MS` | `8000`                    | Request timeout in ms    |
    pub fn from_env() -> Self {
        let enabled = std::env::var("AI_ENABLED")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let endpoint =
            std::env::var("AI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com".into());

        let api_key = std::env::var("AI_API_KEY").ok().filter(|k| !k.is_empty());

        let model = std::env::var("AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());

        let timeout_ms: u64 = std::env::var("AI_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8000);

        Self {
            client: Client::new(),
            endpoint,
            api_key,
            model,
            enabled,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Ask the model for `(point_a, point_b, price)`.
    ///
    /// Retries up to three times with exponential backoff, but only on rate
    /// limiting and transport errors; a malformed answer is final. Any
    /// failure yields `None` so the message simply stays unparsed.
    pub async fn extract(&self, text: &str) -> Option<(String, String, Option<i64>)> {
        if !self.enabled {
            return None;
        }

        // ~1000 chars is plenty for an order post and keeps the prompt cheap.
        let truncated: String = text.chars().take(1000).collect();

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.into(),
                },
                ChatMessage {
                    role: "user",
                    content: truncated,
                },
            ],
            temperature: 0.0,
            max_tokens: 120,
            response_format: Some(ResponseFormat {
                r#type: "json_object",
            }),
        };

        let url = format!("{}/v1/chat/completions", self.endpoint);

        let mut backoff = Duration::from_secs(2);
        for attempt in 1..=MAX_ATTEMPTS {
            let mut req = self.client.post(&url).timeout(self.timeout).json(&request);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            let retryable = match req.send().await {
                Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                    warn!("AI rate-limited (attempt {attempt}/{MAX_ATTEMPTS})");
                    true
                }
                Ok(resp) => {
                    if !resp.status().is_success() {
                        warn!("AI request rejected: HTTP {}", resp.status());
                        return None;
                    }
                    return self.parse_response(resp).await;
                }
                Err(e) => {
                    warn!("AI request failed (attempt {attempt}/{MAX_ATTEMPTS}): {e}");
                    true
                }
            };

            if retryable && attempt < MAX_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        None
    }

    async fn parse_response(&self, resp: reqwest::Response) -> Option<(String, String, Option<i64>)> {
        let body = match resp.json::<ChatResponse>().await {
            Ok(b) => b,
            Err(e) => {
                warn!("AI response parse failed: {e}");
                return None;
            }
        };

        let content = match body.choices.first() {
            Some(c) => &c.message.content,
            None => {
                warn!("AI returned no choices");
                return None;
            }
        };

        let result: AiResult = match serde_json::from_str(content) {
            Ok(r) => r,
            Err(e) => {
                warn!("AI JSON parse failed: {e}, raw: {content}");
                return None;
            }
        };

        debug!(
            "AI verdict: {:?} -> {:?}, price={:?}",
            result.point_a, result.point_b, result.price
        );

        match (result.point_a, result.point_b) {
            (Some(a), Some(b)) if !a.trim().is_empty() && !b.trim().is_empty() => {
                Some((a, b, result.price.filter(|p| *p > 0)))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for AiExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AiExtractor(enabled={}, model={}, endpoint={}, timeout={}ms)",
            self.enabled,
            self.model,
            self.endpoint,
            self.timeout.as_millis(),
        )
    }
}
