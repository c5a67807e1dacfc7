// 💬 Text Assist - Categorize and polish free text
// Callers always get an answer: any provider failure, timeout or odd label
// falls back to the local keyword heuristic.

use anyhow::Result;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use crate::config::Settings;

pub const CATEGORIES: &[&str] = &["return", "delivery", "payment", "general"];

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// The capability the rule sets consume. Infallible by contract.
pub trait TextAssist: Send + Sync {
    /// One of [`CATEGORIES`].
    fn categorize(&self, text: &str) -> String;

    fn improve_draft(&self, draft: &str) -> String;

    /// Called by the engine before each run starts.
    fn begin_run(&self) {}
}

/// A backend that may fail. Wrap it in [`GuardedAssist`] before use.
pub trait AssistProvider: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn categorize(&self, text: &str) -> Result<String>;

    fn improve_draft(&self, draft: &str) -> Result<String>;
}

// ============================================================================
// HEURISTIC
// ============================================================================

const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("return", &["iade", "refund", "return"]),
    ("delivery", &["kargo", "delivery", "shipping"]),
    ("payment", &["odeme", "payment", "charge"]),
];

/// Deterministic keyword matcher. First family that matches wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicAssist;

impl TextAssist for HeuristicAssist {
    fn categorize(&self, text: &str) -> String {
        let lowered = text.to_lowercase();
        CATEGORY_KEYWORDS
            .iter()
            .find(|(_, words)| words.iter().any(|w| lowered.contains(w)))
            .map(|(label, _)| *label)
            .unwrap_or("general")
            .to_string()
    }

    /// Trim trailing whitespace per line and collapse runs of blank lines.
    fn improve_draft(&self, draft: &str) -> String {
        let mut lines: Vec<&str> = Vec::new();
        for line in draft.lines().map(str::trim_end) {
            if line.is_empty() && lines.last().is_some_and(|prev| prev.is_empty()) {
                continue;
            }
            lines.push(line);
        }
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }
}

// ============================================================================
// GUARDED PROVIDER
// ============================================================================

/// Runs a provider on a worker thread bounded by `timeout`.
///
/// The first error or timeout trips the guard: later calls go straight to
/// the heuristic until [`TextAssist::begin_run`] re-arms it.
pub struct GuardedAssist<P: AssistProvider> {
    provider: Arc<P>,
    enabled: bool,
    timeout: Duration,
    tripped: AtomicBool,
    fallback: HeuristicAssist,
}

impl<P: AssistProvider> GuardedAssist<P> {
    pub fn new(provider: P) -> Self {
        GuardedAssist {
            provider: Arc::new(provider),
            enabled: true,
            timeout: DEFAULT_TIMEOUT,
            tripped: AtomicBool::new(false),
            fallback: HeuristicAssist,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    fn trip(&self) {
        self.tripped.store(true, Ordering::Release);
    }

    /// None when disabled, tripped, failed or too slow. A late answer is dropped.
    fn call<F>(&self, op: &'static str, f: F) -> Option<String>
    where
        F: FnOnce(&P) -> Result<String> + Send + 'static,
    {
        if !self.enabled || self.is_tripped() {
            return None;
        }

        let provider = Arc::clone(&self.provider);
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(format!("assist-{}", op))
            .spawn(move || {
                let _ = tx.send(f(provider.as_ref()));
            });
        if let Err(err) = spawned {
            tracing::warn!("{} {}: could not start worker: {}", self.provider.name(), op, err);
            self.trip();
            return None;
        }

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(answer)) => Some(answer),
            Ok(Err(err)) => {
                tracing::warn!("{} {} failed, using heuristic: {:#}", self.provider.name(), op, err);
                self.trip();
                None
            }
            Err(_) => {
                tracing::warn!(
                    "{} {} timed out after {:?}, using heuristic",
                    self.provider.name(),
                    op,
                    self.timeout
                );
                self.trip();
                None
            }
        }
    }
}

impl<P: AssistProvider> TextAssist for GuardedAssist<P> {
    fn categorize(&self, text: &str) -> String {
        let owned = text.to_string();
        let label = self
            .call("categorize", move |p| p.categorize(&owned))
            .map(|label| label.trim().to_lowercase());

        match label {
            Some(label) if CATEGORIES.contains(&label.as_str()) => label,
            Some(other) => {
                tracing::warn!("unexpected category '{}', using heuristic", other);
                self.fallback.categorize(text)
            }
            None => self.fallback.categorize(text),
        }
    }

    fn improve_draft(&self, draft: &str) -> String {
        let owned = draft.to_string();
        self.call("improve_draft", move |p| p.improve_draft(&owned))
            .filter(|improved| !improved.trim().is_empty())
            .unwrap_or_else(|| self.fallback.improve_draft(draft))
    }

    fn begin_run(&self) {
        self.tripped.store(false, Ordering::Release);
    }
}

// ============================================================================
// PII MASKING
// ============================================================================

fn email_pattern() -> Option<&'static Regex> {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL
        .get_or_init(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").ok())
        .as_ref()
}

/// Replace e-mail addresses before text leaves the process.
pub fn mask_pii(text: &str) -> String {
    match email_pattern() {
        Some(pattern) => pattern.replace_all(text, "[EMAIL_MASKED]").into_owned(),
        None => text.to_string(),
    }
}

// ============================================================================
// REMOTE PROVIDER (feature = "remote-assist")
// ============================================================================

#[cfg(feature = "remote-assist")]
pub use remote::OpenAiAssist;

#[cfg(feature = "remote-assist")]
mod remote {
    use super::{mask_pii, AssistProvider, CATEGORIES};
    use anyhow::{anyhow, bail, Context, Result};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
    const ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

    #[derive(Serialize)]
    struct ChatRequest<'a> {
        model: &'a str,
        messages: Vec<ChatMessage<'a>>,
        temperature: f32,
    }

    #[derive(Serialize)]
    struct ChatMessage<'a> {
        role: &'a str,
        content: String,
    }

    #[derive(Deserialize)]
    struct ChatResponse {
        choices: Vec<ChatChoice>,
    }

    #[derive(Deserialize)]
    struct ChatChoice {
        message: ChatContent,
    }

    #[derive(Deserialize)]
    struct ChatContent {
        content: String,
    }

    /// Chat-completions backend. Text is PII-masked before it is sent.
    pub struct OpenAiAssist {
        api_key: String,
        model: String,
        client: reqwest::blocking::Client,
    }

    impl OpenAiAssist {
        pub fn new(api_key: String, timeout: Duration) -> Result<Self> {
            let client = reqwest::blocking::Client::builder()
                .timeout(timeout)
                .build()
                .context("Failed to build HTTP client")?;
            Ok(OpenAiAssist {
                api_key,
                model: DEFAULT_MODEL.to_string(),
                client,
            })
        }

        /// Reads OPENAI_API_KEY; None when unset or blank.
        pub fn from_env(timeout: Duration) -> Option<Self> {
            let key = std::env::var("OPENAI_API_KEY").ok()?;
            if key.trim().is_empty() {
                return None;
            }
            Self::new(key, timeout).ok()
        }

        fn complete(&self, system: &str, user: String, temperature: f32) -> Result<String> {
            let request = ChatRequest {
                model: &self.model,
                messages: vec![
                    ChatMessage {
                        role: "system",
                        content: system.to_string(),
                    },
                    ChatMessage {
                        role: "user",
                        content: user,
                    },
                ],
                temperature,
            };

            let response = self
                .client
                .post(ENDPOINT)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&request)
                .send()
                .context("Request to completion endpoint failed")?;

            let status = response.status();
            if !status.is_success() {
                bail!("completion endpoint returned {}", status);
            }

            let body: ChatResponse = response.json().context("Malformed completion response")?;
            body.choices
                .into_iter()
                .next()
                .map(|c| c.message.content.trim().to_string())
                .ok_or_else(|| anyhow!("completion response had no choices"))
        }
    }

    impl AssistProvider for OpenAiAssist {
        fn name(&self) -> &str {
            "openai"
        }

        fn categorize(&self, text: &str) -> Result<String> {
            let prompt = format!(
                "Categorize this customer message into: {}. Return only the label.\nMessage: {}",
                CATEGORIES.join(", "),
                mask_pii(text)
            );
            self.complete("You are a classifier.", prompt, 0.0)
        }

        fn improve_draft(&self, draft: &str) -> Result<String> {
            self.complete("You improve support emails.", mask_pii(draft), 0.2)
        }
    }
}

// ============================================================================
// SELECTION
// ============================================================================

/// Pick the assist implementation for these settings.
pub fn from_settings(settings: &Settings) -> Box<dyn TextAssist> {
    if !settings.use_remote_assist {
        return Box::new(HeuristicAssist);
    }

    #[cfg(feature = "remote-assist")]
    {
        match OpenAiAssist::from_env(DEFAULT_TIMEOUT) {
            Some(provider) => return Box::new(GuardedAssist::new(provider)),
            None => tracing::warn!("remote assist enabled but OPENAI_API_KEY is not set"),
        }
    }

    #[cfg(not(feature = "remote-assist"))]
    tracing::warn!("remote assist requested but this build lacks the remote-assist feature");

    Box::new(HeuristicAssist)
}

// ============================================================================
// TESTS
// ============================================================================
