//! Credential pools loaded from `account;project;api_key` files.

use crate::error::PipelineError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

static RE_KEY_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(key=|bearer\s+)[^&\s"']+"#).unwrap());

/// One API key with the account/project it belongs to.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub account: String,
    pub project: String,
    pub api_key: String,
}

impl Credential {
    pub fn new(account: impl Into<String>, project: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            project: project.into(),
            api_key: api_key.into(),
        }
    }

    /// A log-safe label; never includes any part of the key.
    pub fn label(&self) -> String {
        match (self.account.is_empty(), self.project.is_empty()) {
            (true, true) => "unnamed".to_string(),
            _ => format!("{}/{}", self.account, self.project),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("account", &self.account)
            .field("project", &self.project)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// An ordered, non-empty list of credentials with a round-robin cursor.
///
/// The cursor is atomic, so [`get_next`](Self::get_next) never blocks and is
/// safe to call from concurrent tasks.
#[derive(Clone)]
pub struct CredentialPool {
    credentials: Arc<Vec<Credential>>,
    cursor: Arc<AtomicUsize>,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>) -> Result<Self, PipelineError> {
        let credentials: Vec<_> = credentials
            .into_iter()
            .filter(|c| !c.api_key.trim().is_empty())
            .collect();
        if credentials.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "credential pool needs at least one non-empty api_key".into(),
            ));
        }
        Ok(Self {
            credentials: Arc::new(credentials),
            cursor: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Parse delimited text: `;` preferred, `,` as fallback, optional header
    /// row, `#` comments, rows with an empty key dropped. A single-column row
    /// is taken as a bare key.
    pub fn parse(text: &str) -> Vec<Credential> {
        let delimiter = if text.contains(';') { b';' } else { b',' };
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());
        reader
            .records()
            .filter_map(|row| match row {
                Ok(row) => Some(row),
                Err(e) => {
                    debug!("Skipping unreadable credential row: {e}");
                    None
                }
            })
            .filter_map(|row| {
                let cols: Vec<&str> = row.iter().collect();
                match cols.as_slice() {
                    [key] => Some(Credential::new("", "", *key)),
                    [account, project, key, ..] => Some(Credential::new(*account, *project, *key)),
                    [account, key] => Some(Credential::new(*account, "", *key)),
                    [] => None,
                }
            })
            .filter(|c| !c.api_key.is_empty() && !c.api_key.eq_ignore_ascii_case("api_key"))
            .collect()
    }

    /// Load a pool from a credential file.
    pub async fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => PipelineError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => PipelineError::FileNotFound {
                path: path.to_path_buf(),
            },
        })?;
        let credentials = Self::parse(&text);
        debug!("Parsed {} credentials from {}", credentials.len(), path.display());
        let pool = Self::new(credentials).map_err(|_| PipelineError::NoCredentials {
            path: path.to_path_buf(),
        })?;
        info!("Loaded {} API keys from {}", pool.len(), path.display());
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// The credential under the cursor; advances the cursor modulo pool size.
    pub fn get_next(&self) -> Credential {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.credentials.len();
        self.credentials[i].clone()
    }

    /// Replace every key in this pool, and any `key=`/`Bearer` token, with `***`.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for c in self.credentials.iter() {
            if c.api_key.len() >= 4 {
                out = out.replace(&c.api_key, "***");
            }
        }
        RE_KEY_PARAM.replace_all(&out, "${1}***").into_owned()
    }
}

impl fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPool")
            .field("size", &self.credentials.len())
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_semicolon_with_header() {
        let creds = CredentialPool::parse("account;project;api_key\nme;p1;AAA111\nme;p2;\nyou;p3;BBB222\n");
        assert_eq!(creds.len(), 2);
        assert_eq!(creds[0].project, "p1");
        assert_eq!(creds[1].api_key, "BBB222");
    }

    #[test]
    fn parse_comma_fallback_and_bare_keys() {
        let creds = CredentialPool::parse("a,b,KEY1\nKEY2\n");
        assert_eq!(creds.len(), 2);
        assert_eq!(creds[1].api_key, "KEY2");
    }

    #[test]
    fn parse_skips_comments_and_blank_lines() {
        let creds = CredentialPool::parse("# gemini keys\n\n me ; p1 ; AAA111 \n\"you\";\"p;2\";BBB222\n");
        assert_eq!(creds.len(), 2);
        assert_eq!(creds[0].api_key, "AAA111");
        assert_eq!(creds[1].project, "p;2");
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(CredentialPool::new(vec![Credential::new("a", "b", "  ")]).is_err());
    }

    #[test]
    fn round_robin_wraps() {
        let pool = CredentialPool::new(vec![
            Credential::new("a", "", "k1"),
            Credential::new("b", "", "k2"),
        ])
        .unwrap();
        let keys: Vec<_> = (0..5).map(|_| pool.get_next().api_key).collect();
        assert_eq!(keys, ["k1", "k2", "k1", "k2", "k1"]);
    }

    #[test]
    fn redaction_hides_keys() {
        let pool = CredentialPool::new(vec![Credential::new("a", "", "SECRET-KEY-123")]).unwrap();
        let msg = pool.redact("bad key SECRET-KEY-123 at https://x/y?key=OTHER&alt=json");
        assert!(!msg.contains("SECRET-KEY-123"));
        assert!(!msg.contains("OTHER"));
        assert!(msg.contains("key=***&alt=json"), "got {msg}");
        assert!(!format!("{:?}", pool.get_next()).contains("SECRET"));
    }

    #[tokio::test]
    async fn load_without_keys_fails() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("keys.csv");
        std::fs::write(&p, "account;project;api_key\n").unwrap();
        let err = CredentialPool::load(&p).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoCredentials { .. }));
    }
}
