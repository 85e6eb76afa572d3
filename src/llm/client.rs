//! The rotating, rate-limit-aware client every stage calls.
//!
//! ## Retry Strategy
//!
//! One call walks the provider's credential pool at most once:
//!
//! 1. A gateway timeout is retried on the same key on the short schedule
//!    (10 s, ×1.5).
//! 2. A rate limit is retried on the same key on the long schedule
//!    (60 s, ×1.5, cap 180 s, three attempts), each attempt wrapping step 1.
//! 3. An auth/leak error rotates to the next key at once; waiting never
//!    revives a leaked key.
//! 4. When the same key is still rate limited or timing out after its
//!    budget, the call rotates as well.
//!
//! After every key has been tried once the call fails with
//! `RateLimitExceeded` or `PoolExhausted`. It never loops forever.
//!
//! A circuit breaker counts rate limits across the whole run. At the
//! threshold (5 in a row) it pauses for a cool-down (5 minutes) before
//! the next request; any success resets it.

use super::{
    clamp_max_tokens, DocumentPayload, LlmBackend, LlmRequest, Provider, ProviderError,
};
use crate::cancel::CancelToken;
use crate::document::DocumentSource;
use crate::error::PipelineError;
use crate::llm::CredentialPool;
use crate::retry::{with_retry, RetryPolicy};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Retry, rotation and breaker tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub rate_limit: RetryPolicy,
    pub timeout: RetryPolicy,
    /// Consecutive rate limits that trip the breaker.
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            rate_limit: RetryPolicy::rate_limit(),
            timeout: RetryPolicy::timeout(),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(300),
        }
    }
}

/// Sampling options shared by both call shapes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

struct ProviderSlot {
    backend: Arc<dyn LlmBackend>,
    pool: CredentialPool,
}

/// Routes requests to a provider by model name and hides credential
/// exhaustion and rate limiting from callers.
pub struct KeyRotationClient {
    slots: BTreeMap<Provider, ProviderSlot>,
    documents: Arc<dyn DocumentSource>,
    cancel: CancelToken,
    settings: ClientSettings,
    consecutive_rate_limits: AtomicU32,
}

impl fmt::Debug for KeyRotationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let providers: Vec<String> = self
            .slots
            .iter()
            .map(|(p, s)| format!("{p}({} keys)", s.pool.len()))
            .collect();
        f.debug_struct("KeyRotationClient")
            .field("providers", &providers)
            .field("settings", &self.settings)
            .finish()
    }
}

impl KeyRotationClient {
    pub fn new(documents: Arc<dyn DocumentSource>, cancel: CancelToken, settings: ClientSettings) -> Self {
        Self {
            slots: BTreeMap::new(),
            documents,
            cancel,
            settings,
            consecutive_rate_limits: AtomicU32::new(0),
        }
    }

    /// Register the backend and key pool serving `provider`.
    pub fn with_provider(mut self, provider: Provider, backend: Arc<dyn LlmBackend>, pool: CredentialPool) -> Self {
        self.slots.insert(provider, ProviderSlot { backend, pool });
        self
    }

    pub fn has_provider(&self, provider: Provider) -> bool {
        self.slots.contains_key(&provider)
    }

    /// Scrub every registered key from `text`.
    pub fn redact(&self, text: &str) -> String {
        self.slots
            .values()
            .fold(text.to_string(), |acc, slot| slot.pool.redact(&acc))
    }

    /// Send text (with an optional system prompt) and return the reply.
    pub async fn process_text(
        &self,
        text: &str,
        system_prompt: Option<&str>,
        model: &str,
        options: CallOptions,
    ) -> Result<String, PipelineError> {
        let request = LlmRequest {
            model: model.to_string(),
            system_prompt: system_prompt.map(str::to_string),
            text: text.to_string(),
            document: None,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };
        self.dispatch(request).await
    }

    /// Attach a PDF to `prompt` and return the reply.
    ///
    /// Providers that take no attachments receive the document's extracted
    /// text appended to the prompt instead.
    pub async fn process_document_with_prompt(
        &self,
        doc_path: &Path,
        prompt: &str,
        model: &str,
        options: CallOptions,
    ) -> Result<String, PipelineError> {
        let slot = self.slot(model)?;
        let mut request = LlmRequest {
            model: model.to_string(),
            system_prompt: None,
            text: prompt.to_string(),
            document: None,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };
        if slot.backend.accepts_documents() {
            let bytes = self.documents.read_bytes(doc_path).await?;
            request.document = Some(DocumentPayload {
                path: doc_path.to_path_buf(),
                mime_type: "application/pdf",
                bytes: Arc::new(bytes),
            });
        } else {
            let pages = self.documents.count_pages(doc_path).await?;
            let content = self.documents.extract_text_range(doc_path, 1, pages).await?;
            request.text = format!("{prompt}\n\nDocument content:\n\n{content}");
        }
        self.dispatch(request).await
    }

    fn slot(&self, model: &str) -> Result<&ProviderSlot, PipelineError> {
        let provider = Provider::for_model(model);
        self.slots.get(&provider).ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "model '{model}' needs provider '{provider}', which has no credentials configured"
            ))
        })
    }

    async fn dispatch(&self, mut request: LlmRequest) -> Result<String, PipelineError> {
        let provider = Provider::for_model(&request.model);
        let slot = self.slot(&request.model)?;
        let clamped = clamp_max_tokens(&request.model, request.max_tokens);
        if clamped != request.max_tokens {
            debug!(
                "max_tokens {} clamped to {} for {}",
                request.max_tokens, clamped, request.model
            );
            request.max_tokens = clamped;
        }

        let pool_size = slot.pool.len();
        let mut last_error: Option<ProviderError> = None;

        for tried in 1..=pool_size {
            let credential = slot.pool.get_next();
            let label = format!("{} key {}/{} [{}]", provider, tried, pool_size, credential.label());
            let outcome = with_retry(
                &self.settings.rate_limit,
                &self.cancel,
                &label,
                |_| self.attempt_with_timeouts(slot, &credential.api_key, &request, &label),
                |e| matches!(e, ProviderError::RateLimited(_)),
            )
            .await;

            match outcome {
                Ok(text) => {
                    debug!("{}: {} chars returned", label, text.len());
                    return Ok(text);
                }
                Err(ProviderError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(ProviderError::Rejected(message)) => {
                    error!("{}: request rejected: {}", label, message);
                    return Err(PipelineError::LlmApiError { message });
                }
                Err(e @ ProviderError::Auth(_)) => {
                    warn!("{}: {}; rotating to next key", label, e);
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!("{}: giving up on this key ({}); rotating", label, e);
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(ProviderError::RateLimited(_)) => PipelineError::RateLimitExceeded {
                provider: provider.to_string(),
            },
            other => PipelineError::PoolExhausted {
                provider: provider.to_string(),
                tried: pool_size,
                last_error: other.map(|e| e.to_string()).unwrap_or_default(),
            },
        })
    }

    /// One rate-limit attempt: the raw call wrapped in the timeout schedule.
    async fn attempt_with_timeouts(
        &self,
        slot: &ProviderSlot,
        api_key: &str,
        request: &LlmRequest,
        label: &str,
    ) -> Result<String, ProviderError> {
        let result = with_retry(
            &self.settings.timeout,
            &self.cancel,
            label,
            |_| async {
                let raw = self.cancel.run(slot.backend.generate(api_key, request)).await?;
                raw.map_err(|e| e.map_message(|m| slot.pool.redact(m)))
            },
            |e| matches!(e, ProviderError::Timeout(_)),
        )
        .await;

        match &result {
            Ok(_) => self.consecutive_rate_limits.store(0, Ordering::Relaxed),
            Err(ProviderError::RateLimited(_)) => self.record_rate_limit().await?,
            Err(_) => {}
        }
        result
    }

    async fn record_rate_limit(&self) -> Result<(), ProviderError> {
        let count = self.consecutive_rate_limits.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.settings.breaker_threshold {
            warn!(
                "Circuit breaker: {} consecutive rate limits, pausing {}s",
                count,
                self.settings.breaker_cooldown.as_secs()
            );
            self.cancel.sleep(self.settings.breaker_cooldown).await?;
            self.consecutive_rate_limits.store(0, Ordering::Relaxed);
            info!("Circuit breaker reset, resuming requests");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Credential;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Backend that replays a fixed script of outcomes and records keys used.
    struct Scripted {
        script: Mutex<Vec<Result<String, ProviderError>>>,
        keys_seen: Mutex<Vec<String>>,
        max_tokens_seen: Mutex<Vec<u32>>,
    }

    impl Scripted {
        fn new(mut script: Vec<Result<String, ProviderError>>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                keys_seen: Mutex::new(Vec::new()),
                max_tokens_seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        fn accepts_documents(&self) -> bool {
            true
        }
        async fn generate(&self, api_key: &str, request: &LlmRequest) -> Result<String, ProviderError> {
            self.keys_seen.lock().unwrap().push(api_key.to_string());
            self.max_tokens_seen.lock().unwrap().push(request.max_tokens);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ProviderError::Rejected("script exhausted".into())))
        }
    }

    struct NoDocs;

    #[async_trait]
    impl DocumentSource for NoDocs {
        async fn count_pages(&self, _: &Path) -> Result<usize, PipelineError> {
            Ok(1)
        }
        async fn extract_text_range(&self, _: &Path, _: usize, _: usize) -> Result<String, PipelineError> {
            Ok("page text".into())
        }
        async fn read_bytes(&self, _: &Path) -> Result<Vec<u8>, PipelineError> {
            Ok(b"%PDF".to_vec())
        }
    }

    fn pool(n: usize) -> CredentialPool {
        CredentialPool::new(
            (0..n)
                .map(|i| Credential::new("acct", format!("p{i}"), format!("key-{i}")))
                .collect(),
        )
        .unwrap()
    }

    fn client(backend: Arc<Scripted>, keys: usize) -> KeyRotationClient {
        KeyRotationClient::new(Arc::new(NoDocs), CancelToken::new(), ClientSettings::default())
            .with_provider(Provider::Gemini, backend, pool(keys))
    }

    const OPTS: CallOptions = CallOptions {
        temperature: 0.7,
        max_tokens: 100_000,
    };

    #[tokio::test(start_paused = true)]
    async fn leak_errors_cycle_every_key_once_then_exhaust() {
        let n = 4;
        let backend = Scripted::new(
            (0..n + 3)
                .map(|_| Err(ProviderError::Auth("API key reported as leaked".into())))
                .collect(),
        );
        let c = client(backend.clone(), n);
        let err = c.process_text("x", None, "gemini-2.5-pro", OPTS).await.unwrap_err();
        assert!(
            matches!(err, PipelineError::PoolExhausted { tried: 4, .. }),
            "got {err}"
        );
        let seen = backend.keys_seen.lock().unwrap().clone();
        assert_eq!(seen, ["key-0", "key-1", "key-2", "key-3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_key_auth_failure_exhausts_the_pool() {
        let backend = Scripted::new(vec![Err(ProviderError::Auth("403 permission denied".into()))]);
        let c = client(backend.clone(), 1);
        let err = c.process_text("x", None, "gemini-2.5-pro", OPTS).await.unwrap_err();
        assert!(
            matches!(err, PipelineError::PoolExhausted { tried: 1, .. }),
            "got {err}"
        );
        assert_eq!(*backend.keys_seen.lock().unwrap(), ["key-0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_backs_off_on_same_key_then_succeeds() {
        let backend = Scripted::new(vec![
            Err(ProviderError::RateLimited("429".into())),
            Err(ProviderError::RateLimited("429".into())),
            Ok("done".into()),
        ]);
        let c = client(backend.clone(), 3);
        let started = tokio::time::Instant::now();
        let out = c.process_text("x", None, "gemini-2.5-pro", OPTS).await.unwrap();
        assert_eq!(out, "done");
        assert_eq!(*backend.keys_seen.lock().unwrap(), ["key-0", "key-0", "key-0"]);
        // 60 s + 90 s of virtual backoff.
        assert!(started.elapsed() >= Duration::from_secs(150));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_rate_limit_rotates_then_fails() {
        let backend = Scripted::new(
            (0..6)
                .map(|_| Err(ProviderError::RateLimited("quota".into())))
                .collect(),
        );
        let c = client(backend.clone(), 2);
        let err = c.process_text("x", None, "gemini-2.5-pro", OPTS).await.unwrap_err();
        assert!(matches!(err, PipelineError::RateLimitExceeded { .. }), "got {err}");
        let seen = backend.keys_seen.lock().unwrap().clone();
        assert_eq!(seen, ["key-0", "key-0", "key-0", "key-1", "key-1", "key-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_retry_on_short_schedule() {
        let backend = Scripted::new(vec![
            Err(ProviderError::Timeout("504".into())),
            Ok("ok".into()),
        ]);
        let c = client(backend.clone(), 1);
        let started = tokio::time::Instant::now();
        assert_eq!(c.process_text("x", None, "gemini-2.5-pro", OPTS).await.unwrap(), "ok");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_not_retried_and_is_redacted() {
        let backend = Scripted::new(vec![Err(ProviderError::Rejected(
            "bad request for key-0 at ?key=key-0".into(),
        ))]);
        let c = client(backend.clone(), 2);
        let err = c.process_text("x", None, "gemini-2.5-pro", OPTS).await.unwrap_err();
        let msg = err.to_string();
        assert!(!msg.contains("key-0"), "leaked: {msg}");
        assert_eq!(backend.keys_seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn max_tokens_is_clamped_to_ceiling() {
        let backend = Scripted::new(vec![Ok("a".into()), Ok("b".into())]);
        let c = client(backend.clone(), 1);
        c.process_text("x", None, "gemini-2.5-pro", OPTS).await.unwrap();
        c.process_text("x", None, "gemini-2.0-flash", OPTS).await.unwrap();
        assert_eq!(*backend.max_tokens_seen.lock().unwrap(), [32_768, 8_192]);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_trips_after_threshold() {
        let mut script: Vec<_> = (0..5)
            .map(|_| Err(ProviderError::RateLimited("429".into())))
            .collect();
        script.push(Ok("after cooldown".into()));
        let backend = Scripted::new(script);
        let settings = ClientSettings {
            rate_limit: RetryPolicy::fixed(3, Duration::from_secs(1)),
            ..ClientSettings::default()
        };
        let c = KeyRotationClient::new(Arc::new(NoDocs), CancelToken::new(), settings)
            .with_provider(Provider::Gemini, backend.clone(), pool(2));
        let started = tokio::time::Instant::now();
        let out = c.process_text("x", None, "gemini-2.5-pro", OPTS).await.unwrap();
        assert_eq!(out, "after cooldown");
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert_eq!(c.consecutive_rate_limits.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn unknown_provider_is_a_config_error() {
        let backend = Scripted::new(vec![]);
        let c = client(backend, 1);
        let err = c.process_text("x", None, "deepseek-chat", OPTS).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }
}
