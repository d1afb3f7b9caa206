//! Analysis provider
//!
//! The LLM side of the engine: per-turn affect analysis at ingestion, and
//! the two rewrite prompts used by tier compression (L1→L2 summary,
//! L2→L3 keyword digest).

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::config::LlmConfig;
use crate::memory::TurnAnalysis;

/// Provider error. A schema violation skips the affected turn or leaves the
/// affected record at its prior level; it never fails the surrounding batch.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),
    #[error("Provider request timed out")]
    Timeout,
    #[error("Provider response violates the expected schema: {0}")]
    SchemaViolation(String),
}

/// A trigger/content rewrite returned by the compression prompts
#[derive(Debug, Clone, Deserialize)]
pub struct Rewrite {
    pub trigger: String,
    pub content: String,
}

/// The LLM operations the engine depends on
pub trait AnalysisProvider: Send + Sync {
    /// Affect + summary analysis of one conversation turn
    fn analyze_turn(&self, user_text: &str, assistant_text: &str)
        -> Result<TurnAnalysis, ProviderError>;

    /// L1→L2: summarize trigger (~1 sentence) and content (~2-3 sentences)
    fn summarize(&self, trigger: &str, content: &str) -> Result<Rewrite, ProviderError>;

    /// L2→L3: reduce trigger and content to comma-separated keyword lists
    fn keywordize(&self, trigger: &str, content: &str) -> Result<Rewrite, ProviderError>;
}

// ============================================================================
// PROMPTS
// ============================================================================

const TURN_ANALYSIS_PROMPT: &str = r#"Analyze the conversation below and reply with a single JSON object, nothing else.

## Conversation
User: {user_text}
Assistant: {assistant_text}

## Output format
```json
{
  "emotional_intensity": <integer 0-100, emotional significance>,
  "emotional_valence": "<positive/negative/neutral>",
  "emotional_arousal": <integer 0-100, arousal level>,
  "emotional_tags": ["<emotion tag>", ...],
  "category": "<casual/work/decision/emotional>",
  "keywords": ["<keyword>", ...],
  "trigger": "<what prompted the exchange, one sentence>",
  "content": "<what the assistant did or said, one or two sentences>",
  "protected": <true/false>
}
```

## Guidance
- emotional_intensity: routine technical exchange = 15-25, deeply emotional exchange = 70-85
- category: small talk = casual, work topics = work, important decisions = decision, emotional exchanges = emotional
- protected: true only when the user explicitly asks to remember, e.g. "覚えておいて", "忘れないで", "絶対に忘れないで", "remember this""#;

const SUMMARIZE_PROMPT: &str = r#"Summarize the memory below and reply with a single JSON object, nothing else.

## Summary rules
- trigger: what prompted the exchange, in one or two sentences; keep the concrete topic or question
- content: how the assistant responded, in two or three sentences; keep what was explained and how the user reacted
- never drop proper nouns, technical terms or concrete topics
- keep any emotional nuance

## Memory
Trigger:
{trigger}

Content:
{content}

## Output format
```json
{
  "trigger": "<summarized trigger>",
  "content": "<summarized content>"
}
```"#;

const KEYWORDS_PROMPT: &str = r#"Reduce the memory below to keywords and reply with a single JSON object, nothing else.

## Rules
- trigger: 2-3 comma-separated keywords naming what prompted the exchange
- content: 2-3 comma-separated keywords naming what was discussed or done
- prefer proper nouns and technical terms

## Memory
Trigger:
{trigger}

Content:
{content}

## Output format
```json
{
  "trigger": "<keyword, keyword, keyword>",
  "content": "<keyword, keyword, keyword>"
}
```"#;

/// Extract the JSON object from an LLM reply that may wrap it in a code fence
pub fn extract_json(text: &str) -> &str {
    if let Some(start) = text.find("```json") {
        let body = &text[start + 7..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }
    if let Some(start) = text.find("```") {
        let body = &text[start + 3..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }
    text.trim()
}

// ============================================================================
// ANTHROPIC CLIENT
// ============================================================================

/// Anthropic messages client (blocking, 30 s timeout, bounded retries)
pub struct AnthropicAnalysis {
    client: reqwest::blocking::Client,
    messages_url: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    max_retries: u32,
}

impl AnthropicAnalysis {
    pub fn new(base_url: &str, api_key: &str, config: &LlmConfig) -> Self {
        let base = base_url.trim_end_matches('/');
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        Self {
            client,
            messages_url: format!("{base}/v1/messages"),
            api_key: api_key.to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: 3,
        }
    }

    /// Build from config, reading the key from `ANTHROPIC_API_KEY`
    pub fn from_config(config: &LlmConfig) -> Self {
        let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();
        Self::new("https://api.anthropic.com", &api_key, config)
    }

    fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": [{ "role": "user", "content": prompt }]
        });

        let mut last_err = ProviderError::Unavailable("no attempt made".to_string());
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                std::thread::sleep(Duration::from_millis(1000 * u64::from(attempt)));
                tracing::warn!("retrying analysis request (attempt {})", attempt + 1);
            }

            let response = match self
                .client
                .post(&self.messages_url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
            {
                Ok(r) => r,
                Err(e) if e.is_timeout() => {
                    last_err = ProviderError::Timeout;
                    continue;
                }
                Err(e) => {
                    last_err = ProviderError::Unavailable(e.to_string());
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                last_err = ProviderError::Unavailable(format!("analysis API error {status}"));
                continue;
            }
            if !status.is_success() {
                return Err(ProviderError::Unavailable(format!(
                    "analysis API error {status}"
                )));
            }

            let payload: serde_json::Value = response
                .json()
                .map_err(|e| ProviderError::SchemaViolation(e.to_string()))?;
            return payload
                .get("content")
                .and_then(|c| c.as_array())
                .and_then(|blocks| blocks.first())
                .and_then(|block| block.get("text"))
                .and_then(|t| t.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    ProviderError::SchemaViolation("missing content[0].text".to_string())
                });
        }

        Err(last_err)
    }

    fn rewrite(&self, template: &str, trigger: &str, content: &str) -> Result<Rewrite, ProviderError> {
        let prompt = template
            .replace("{trigger}", trigger)
            .replace("{content}", content);
        let reply = self.complete(&prompt)?;
        serde_json::from_str(extract_json(&reply))
            .map_err(|e| ProviderError::SchemaViolation(e.to_string()))
    }
}

impl AnalysisProvider for AnthropicAnalysis {
    fn analyze_turn(
        &self,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<TurnAnalysis, ProviderError> {
        let prompt = TURN_ANALYSIS_PROMPT
            .replace("{user_text}", user_text)
            .replace("{assistant_text}", assistant_text);
        let reply = self.complete(&prompt)?;
        let analysis: TurnAnalysis = serde_json::from_str(extract_json(&reply))
            .map_err(|e| ProviderError::SchemaViolation(e.to_string()))?;
        if !analysis.is_in_range() {
            return Err(ProviderError::SchemaViolation(format!(
                "affect integers out of range: intensity={}, arousal={}",
                analysis.emotional_intensity, analysis.emotional_arousal
            )));
        }
        Ok(analysis)
    }

    fn summarize(&self, trigger: &str, content: &str) -> Result<Rewrite, ProviderError> {
        self.rewrite(SUMMARIZE_PROMPT, trigger, content)
    }

    fn keywordize(&self, trigger: &str, content: &str) -> Result<Rewrite, ProviderError> {
        self.rewrite(KEYWORDS_PROMPT, trigger, content)
    }
}

// ============================================================================
// SCRIPTED PROVIDER (tests / offline smoke runs)
// ============================================================================

/// Deterministic analysis provider: turns analyze to a fixed profile and
/// rewrites are mechanical truncations. No network.
pub struct ScriptedAnalysis {
    analysis: TurnAnalysis,
    /// When true, every call fails as unavailable
    pub fail: std::sync::atomic::AtomicBool,
}

impl ScriptedAnalysis {
    pub fn new(analysis: TurnAnalysis) -> Self {
        Self {
            analysis,
            fail: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn check_available(&self) -> Result<(), ProviderError> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            Err(ProviderError::Unavailable("scripted failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl AnalysisProvider for ScriptedAnalysis {
    fn analyze_turn(
        &self,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<TurnAnalysis, ProviderError> {
        self.check_available()?;
        let mut analysis = self.analysis.clone();
        analysis.trigger = user_text.to_string();
        analysis.content = assistant_text.to_string();
        Ok(analysis)
    }

    fn summarize(&self, trigger: &str, content: &str) -> Result<Rewrite, ProviderError> {
        self.check_available()?;
        Ok(Rewrite {
            trigger: format!("summary: {}", head(trigger, 40)),
            content: format!("summary: {}", head(content, 80)),
        })
    }

    fn keywordize(&self, trigger: &str, content: &str) -> Result<Rewrite, ProviderError> {
        self.check_available()?;
        Ok(Rewrite {
            trigger: head(trigger, 20).to_string(),
            content: head(content, 20).to_string(),
        })
    }
}

fn head(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Category, Valence};

    #[test]
    fn test_extract_json_from_fenced_reply() {
        let reply = "Here you go:\n```json\n{\"trigger\": \"t\", \"content\": \"c\"}\n```\nDone.";
        let rewrite: Rewrite = serde_json::from_str(extract_json(reply)).unwrap();
        assert_eq!(rewrite.trigger, "t");
        assert_eq!(rewrite.content, "c");
    }

    #[test]
    fn test_extract_json_bare_fence() {
        let reply = "```\n{\"trigger\": \"a\", \"content\": \"b\"}\n```";
        let rewrite: Rewrite = serde_json::from_str(extract_json(reply)).unwrap();
        assert_eq!(rewrite.trigger, "a");
    }

    #[test]
    fn test_extract_json_unfenced() {
        let reply = " {\"trigger\": \"x\", \"content\": \"y\"} ";
        let rewrite: Rewrite = serde_json::from_str(extract_json(reply)).unwrap();
        assert_eq!(rewrite.content, "y");
    }

    #[test]
    fn test_scripted_provider_carries_turn_text() {
        let provider = ScriptedAnalysis::new(TurnAnalysis {
            emotional_intensity: 40,
            emotional_valence: Valence::Positive,
            emotional_arousal: 35,
            emotional_tags: vec!["joy".into()],
            category: Category::Work,
            keywords: vec!["rust".into()],
            trigger: String::new(),
            content: String::new(),
            protected: false,
        });

        let analysis = provider.analyze_turn("hello", "world").unwrap();
        assert_eq!(analysis.trigger, "hello");
        assert_eq!(analysis.content, "world");
        assert_eq!(analysis.emotional_intensity, 40);
    }

    #[test]
    fn test_scripted_provider_failure_mode() {
        let provider = ScriptedAnalysis::new(TurnAnalysis {
            emotional_intensity: 10,
            emotional_valence: Valence::Neutral,
            emotional_arousal: 10,
            emotional_tags: vec![],
            category: Category::Casual,
            keywords: vec![],
            trigger: String::new(),
            content: String::new(),
            protected: false,
        });
        provider.fail.store(true, std::sync::atomic::Ordering::Relaxed);
        assert!(provider.analyze_turn("a", "b").is_err());
        assert!(provider.summarize("a", "b").is_err());
    }
}
