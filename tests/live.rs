//! Live provider tests.
//!
//! These make real API calls and are gated behind `CONTENT_PIPELINE_LIVE=1`
//! plus a credential file in `CONTENT_PIPELINE_GEMINI_KEYS`.
//!
//! Run with:
//!   CONTENT_PIPELINE_LIVE=1 CONTENT_PIPELINE_GEMINI_KEYS=keys.csv \
//!     cargo test --test live -- --nocapture

use content_pipeline::llm::{CallOptions, GeminiBackend};
use content_pipeline::{
    json_repair, CancelToken, ClientSettings, CredentialPool, DocumentSource, KeyRotationClient,
    PdfiumDocuments, Provider,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Skip this test unless live runs are enabled and a key file is present.
macro_rules! live_skip_unless_ready {
    () => {{
        if std::env::var("CONTENT_PIPELINE_LIVE").as_deref() != Ok("1") {
            println!("SKIP - set CONTENT_PIPELINE_LIVE=1 to run live tests");
            return;
        }
        let Some(keys) = std::env::var_os("CONTENT_PIPELINE_GEMINI_KEYS").map(PathBuf::from) else {
            println!("SKIP - CONTENT_PIPELINE_GEMINI_KEYS is not set");
            return;
        };
        if !keys.exists() {
            println!("SKIP - key file not found: {}", keys.display());
            return;
        }
        keys
    }};
}

fn model() -> String {
    std::env::var("CONTENT_PIPELINE_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".into())
}

#[tokio::test]
async fn gemini_returns_extractable_json() {
    let keys = live_skip_unless_ready!();
    let pool = CredentialPool::load(&keys).await.expect("credential file");
    let documents: Arc<dyn DocumentSource> = Arc::new(PdfiumDocuments::from_env());
    let backend = GeminiBackend::new(Duration::from_secs(120)).expect("HTTP client");
    let client = KeyRotationClient::new(documents, CancelToken::new(), ClientSettings::default())
        .with_provider(Provider::Gemini, Arc::new(backend), pool);

    let reply = client
        .process_text(
            "Return a JSON array with two objects, each with keys \"PointId\" (a ten-digit string) \
             and \"Imp\" (an integer 1-5). Return only JSON.",
            None,
            &model(),
            CallOptions {
                temperature: 0.0,
                max_tokens: 1024,
            },
        )
        .await
        .expect("live call");
    println!("reply: {reply}");

    let value = json_repair::extract(&reply).expect("JSON in reply");
    let rows = value.as_array().expect("array");
    assert!(!rows.is_empty());
    assert!(rows.iter().all(|r| r.get("PointId").is_some()));
}
