//! The narrative file backing `WHOIS Anonymous[N]`.
//!
//! WHOIS of an anonymous nick answers with line N of a configured
//! plain-text file, or a fixed fallback. The reply must never identify
//! anyone; it is a novelty surface and nothing else.
use std::path::PathBuf;

/// Reply used when no narrative file is configured or the line is absent.
pub const FALLBACK: &str = "I am the owner of my actions, heir of my actions, actions are the \
womb (from which I have sprung), actions are my relations, actions are my protection. Whatever \
actions I do, good or bad, of these I shall become the heir.";

#[derive(Debug, Clone, Default)]
pub struct Narrative {
    path: Option<PathBuf>,
}

impl Narrative {
    pub fn new(path: &str) -> Self {
        Self {
            path: (!path.is_empty()).then(|| PathBuf::from(path)),
        }
    }

    /// Line `n` (1-based) of the narrative file, or the fallback.
    pub async fn line(&self, n: usize) -> String {
        let Some(path) = &self.path else {
            return FALLBACK.to_owned();
        };

        match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents
                .lines()
                .nth(n.saturating_sub(1))
                .filter(|line| !line.trim().is_empty())
                .map(str::to_owned)
                .unwrap_or_else(|| FALLBACK.to_owned()),
            Err(err) => {
                tracing::warn!("failed to read narrative file: {err}");
                FALLBACK.to_owned()
            }
        }
    }
}
