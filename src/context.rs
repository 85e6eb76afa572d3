//! Everything a stage needs for one run, passed explicitly.
//!
//! There are no process-wide singletons: the configuration, the rotating
//! client, the document collaborator, the cancellation token and the
//! progress sink all live here and are handed to every stage by reference.

use crate::cancel::CancelToken;
use crate::config::PipelineConfig;
use crate::document::DocumentSource;
use crate::error::PipelineError;
use crate::llm::{
    CallOptions, CredentialPool, DeepSeekBackend, GeminiBackend, KeyRotationClient, Provider,
};
use crate::progress::{NoopProgressCallback, ProgressCallback, StagePhase};
use crate::stages::StageId;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Shared state for one pipeline run.
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub client: KeyRotationClient,
    pub documents: Arc<dyn DocumentSource>,
    pub cancel: CancelToken,
    pub progress: ProgressCallback,
}

impl fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("config", &self.config)
            .field("client", &self.client)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl PipelineContext {
    /// Assemble a context from ready-made parts.
    ///
    /// The client must have been built with the same `documents` and
    /// `cancel` so document calls and backoff sleeps observe them too.
    pub fn new(
        config: PipelineConfig,
        client: KeyRotationClient,
        documents: Arc<dyn DocumentSource>,
        cancel: CancelToken,
    ) -> Self {
        let progress = config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback));
        Self {
            config,
            client,
            documents,
            cancel,
            progress,
        }
    }

    /// Build the HTTP backends for whichever pools are given.
    pub fn with_pools(
        config: PipelineConfig,
        documents: Arc<dyn DocumentSource>,
        cancel: CancelToken,
        gemini: Option<CredentialPool>,
        deepseek: Option<CredentialPool>,
    ) -> Result<Self, PipelineError> {
        let timeout = Duration::from_secs(config.api_timeout_secs);
        let http_err = |e: reqwest::Error| PipelineError::Internal(format!("HTTP client: {e}"));
        let mut client = KeyRotationClient::new(documents.clone(), cancel.clone(), config.client.clone());
        if let Some(pool) = gemini {
            let backend = GeminiBackend::new(timeout).map_err(http_err)?;
            client = client.with_provider(Provider::Gemini, Arc::new(backend), pool);
        }
        if let Some(pool) = deepseek {
            let backend = DeepSeekBackend::new(timeout).map_err(http_err)?;
            client = client.with_provider(Provider::DeepSeek, Arc::new(backend), pool);
        }
        if !client.has_provider(Provider::Gemini) && !client.has_provider(Provider::DeepSeek) {
            return Err(PipelineError::InvalidConfig(
                "no credentials configured for any provider".into(),
            ));
        }
        Ok(Self::new(config, client, documents, cancel))
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    pub fn call_options(&self) -> CallOptions {
        CallOptions {
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        }
    }

    pub fn phase(&self, stage: StageId, phase: StagePhase) {
        self.progress.on_stage_phase(stage, phase);
    }

    /// The fixed pause between successive units of one stage.
    pub async fn pace(&self) -> Result<(), PipelineError> {
        if !self.config.pacing_delay.is_zero() {
            self.cancel.sleep(self.config.pacing_delay).await?;
        }
        Ok(())
    }
}
