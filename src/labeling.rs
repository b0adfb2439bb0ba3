//! Short labels for groups of prompts
//!
//! A configured completion endpoint is asked first, with a hard timeout.
//! Without one, or when it fails, the label comes from the most frequent
//! non-stop-word terms.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound for the remote call
pub const MAX_TIMEOUT: Duration = Duration::from_secs(2);

/// Terms in a rule-based label
const LABEL_TERMS: usize = 3;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "this", "that", "from", "into", "what", "when", "where", "which",
    "how", "why", "can", "could", "should", "would", "will", "you", "your", "are", "was", "were",
    "has", "have", "had", "not", "but", "all", "any", "some", "use", "using", "make", "please",
    "there", "their", "them", "then", "than", "also", "just", "like", "about", "its", "it's",
    "does", "did", "get", "got", "need", "want", "let", "lets", "now", "new", "add", "file",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelSource {
    Remote,
    Rules,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Label {
    pub label: String,
    pub source: LabelSource,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LabelRequest {
    pub texts: Vec<String>,
}

#[derive(Serialize)]
struct RemoteRequest<'a> {
    texts: &'a [String],
    max_words: usize,
}

#[derive(Deserialize)]
struct RemoteResponse {
    label: String,
}

/// Most frequent terms, ties in order of first appearance
pub fn rule_label(texts: &[String]) -> String {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let mut order = 0;
    for text in texts {
        for word in text
            .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '\''))
            .map(|w| w.trim_matches('\'').to_lowercase())
            .filter(|w| w.chars().count() >= 3)
            .filter(|w| !w.chars().all(|c| c.is_ascii_digit()))
            .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        {
            let slot = counts.entry(word).or_insert((0, order));
            slot.0 += 1;
            order += 1;
        }
    }
    let mut terms: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    terms.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    let label: Vec<String> = terms.into_iter().take(LABEL_TERMS).map(|(w, _)| w).collect();
    if label.is_empty() {
        "misc".to_string()
    } else {
        label.join(" ")
    }
}

#[derive(Clone)]
pub struct Labeler {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl Labeler {
    pub fn new(endpoint: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout.min(MAX_TIMEOUT))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.filter(|e| !e.trim().is_empty()),
        })
    }

    /// Rules only
    pub fn offline() -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: None,
        }
    }

    pub fn has_endpoint(&self) -> bool {
        self.endpoint.is_some()
    }

    pub async fn label(&self, texts: &[String]) -> Result<Label> {
        if texts.iter().all(|t| t.trim().is_empty()) {
            return Err(Error::invalid("no texts to label"));
        }
        if let Some(endpoint) = &self.endpoint {
            match self.remote(endpoint, texts).await {
                Ok(label) => {
                    return Ok(Label {
                        label,
                        source: LabelSource::Remote,
                    })
                }
                Err(e) => tracing::debug!(error = %e, "remote labeling failed, using rules"),
            }
        }
        Ok(Label {
            label: rule_label(texts),
            source: LabelSource::Rules,
        })
    }

    async fn remote(&self, endpoint: &str, texts: &[String]) -> anyhow::Result<String> {
        let response: RemoteResponse = self
            .client
            .post(endpoint)
            .json(&RemoteRequest {
                texts,
                max_words: LABEL_TERMS + 2,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let label = response.label.trim();
        anyhow::ensure!(!label.is_empty(), "empty label");
        Ok(label.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rule_label_picks_frequent_terms() {
        let label = rule_label(&texts(&[
            "Fix the login redirect",
            "login redirect loops after logout",
            "why does login fail",
        ]));
        assert_eq!(label, "login redirect fix");
    }

    #[test]
    fn test_rule_label_of_stop_words_only() {
        assert_eq!(rule_label(&texts(&["and the", "42"])), "misc");
    }

    #[tokio::test]
    async fn test_offline_labeler_uses_rules() {
        let labeler = Labeler::offline();
        let label = labeler.label(&texts(&["parser error recovery"])).await.unwrap();
        assert_eq!(label.source, LabelSource::Rules);
        assert_eq!(label.label, "parser error recovery");
        assert!(labeler.label(&texts(&["  "])).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_falls_back() {
        let labeler =
            Labeler::new(Some("http://127.0.0.1:9/label".into()), Duration::from_millis(200)).unwrap();
        let label = labeler.label(&texts(&["cache invalidation"])).await.unwrap();
        assert_eq!(label.source, LabelSource::Rules);
    }
}
