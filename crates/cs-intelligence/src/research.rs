//! Web research used by the coordinator to widen context after a failure.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::retrieval::{LanguageIndex, RetrievalError};

#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("search request failed: {0}")]
    Http(String),
    #[error("search provider returned status {0}")]
    Status(u16),
    #[error("unparseable search response: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl SearchResult {
    pub fn new(title: impl Into<String>, url: impl Into<String>, snippet: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            snippet: snippet.into(),
            source: "web".into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// `title: snippet`, used in result envelopes.
    pub fn summary(&self) -> String {
        if self.title.is_empty() || self.snippet.starts_with(&self.title) {
            self.snippet.clone()
        } else {
            format!("{}: {}", self.title, self.snippet)
        }
    }
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, ResearchError>;
}

// ---------------------------------------------------------------------------
// DuckDuckGo instant-answer API
// ---------------------------------------------------------------------------

pub struct DuckDuckGo {
    client: reqwest::Client,
    base_url: String,
}

impl DuckDuckGo {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(cfg: &cs_core::config::ResearchConfig) -> Self {
        Self::new(cfg.search_url.clone(), Duration::from_secs(cfg.timeout_secs))
    }
}

/// Abstract first, then related topics with text, up to `max_results`.
/// Nested topic groups (`{"Topics": [...]}`) are flattened.
pub fn parse_instant_answer(body: &Value, query: &str, max_results: usize) -> Vec<SearchResult> {
    let mut out = Vec::new();
    let field = |v: &Value, k: &str| v.get(k).and_then(Value::as_str).unwrap_or("").to_string();

    let abstract_text = field(body, "Abstract");
    if !abstract_text.is_empty() {
        let heading = field(body, "Heading");
        out.push(
            SearchResult::new(
                if heading.is_empty() { query.to_string() } else { heading },
                field(body, "AbstractURL"),
                abstract_text,
            )
            .with_source("duckduckgo_instant"),
        );
    }

    let mut stack: Vec<&Value> = body
        .get("RelatedTopics")
        .and_then(Value::as_array)
        .map(|a| a.iter().rev().collect())
        .unwrap_or_default();
    while let Some(topic) = stack.pop() {
        if out.len() >= max_results {
            break;
        }
        if let Some(nested) = topic.get("Topics").and_then(Value::as_array) {
            stack.extend(nested.iter().rev());
            continue;
        }
        let text = field(topic, "Text");
        if text.is_empty() {
            continue;
        }
        let title: String = text.chars().take(100).collect();
        out.push(
            SearchResult::new(title, field(topic, "FirstURL"), text).with_source("duckduckgo_related"),
        );
    }
    out.truncate(max_results);
    out
}

#[async_trait]
impl WebSearch for DuckDuckGo {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, ResearchError> {
        let resp = self
            .client
            .get(format!("{}/", self.base_url))
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .await
            .map_err(|e| ResearchError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ResearchError::Status(resp.status().as_u16()));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ResearchError::Parse(e.to_string()))?;
        let results = parse_instant_answer(&body, query, max_results);
        debug!(results = results.len(), "web search finished");
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// MockSearch
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockSearch {
    results: Vec<SearchResult>,
    fail: bool,
    queries: Mutex<Vec<String>>,
}

impl MockSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, result: SearchResult) -> Self {
        self.results.push(result);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl WebSearch for MockSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, ResearchError> {
        self.queries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(query.to_string());
        if self.fail {
            return Err(ResearchError::Http("mock search failure".into()));
        }
        Ok(self.results.iter().take(max_results).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Markdown block appended to a task description.
pub fn format_for_prompt(results: &[SearchResult], query: &str) -> String {
    if results.is_empty() {
        return format!("No web results found for: {query}");
    }
    let mut out = format!(
        "## Web results for \"{}\"\n\n*{} results, {}*\n\n---\n\n",
        query,
        results.len(),
        Utc::now().format("%Y-%m-%d %H:%M")
    );
    for (i, r) in results.iter().enumerate() {
        out.push_str(&format!("### {}. {}\n", i + 1, r.title));
        if !r.url.is_empty() {
            out.push_str(&format!("**URL:** {}\n\n", r.url));
        }
        out.push_str(&format!("**Summary:** {}\n\n---\n\n", r.snippet));
    }
    out
}

/// Store results as research documents. Returns the number of chunks
/// written; individual failures are logged and skipped.
pub async fn save_to_index(
    index: &LanguageIndex,
    results: &[SearchResult],
    query: &str,
) -> Result<usize, RetrievalError> {
    let mut written = 0;
    for r in results {
        let body = format!("{}\n\n{}\n\nQuery: {}", r.title, r.snippet, query);
        let source = (!r.url.is_empty()).then_some(r.url.as_str());
        match index.index_research(&body, &r.title, source).await {
            Ok(n) => written += n,
            Err(e) => warn!(url = %r.url, error = %e, "failed to index search result"),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_abstract_and_related() {
        let body = json!({
            "Heading": "Rust",
            "Abstract": "A systems language",
            "AbstractURL": "https://rust-lang.org",
            "RelatedTopics": [
                {"Text": "Cargo is the package manager", "FirstURL": "https://a"},
                {"Name": "group", "Topics": [{"Text": "Crates.io registry", "FirstURL": "https://b"}]},
                {"Text": ""},
            ]
        });
        let r = parse_instant_answer(&body, "rust", 5);
        assert_eq!(r.len(), 3);
        assert_eq!(r[0].title, "Rust");
        assert_eq!(r[0].source, "duckduckgo_instant");
        assert_eq!(r[2].snippet, "Crates.io registry");
    }

    #[test]
    fn respects_max_results() {
        let body = json!({"RelatedTopics": [{"Text": "a"}, {"Text": "b"}, {"Text": "c"}]});
        assert_eq!(parse_instant_answer(&body, "q", 2).len(), 2);
        assert!(parse_instant_answer(&json!({}), "q", 5).is_empty());
    }

    #[test]
    fn prompt_format() {
        let r = vec![SearchResult::new("Title", "https://x", "snippet text")];
        let s = format_for_prompt(&r, "q");
        assert!(s.contains("### 1. Title"));
        assert!(s.contains("snippet text"));
        assert_eq!(format_for_prompt(&[], "q"), "No web results found for: q");
    }

    #[tokio::test]
    async fn mock_records_queries() {
        let s = MockSearch::new().with_result(SearchResult::new("t", "u", "s"));
        let r = s.search("how to x", 3).await.unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(s.queries(), vec!["how to x"]);
        assert!(MockSearch::failing().search("q", 1).await.is_err());
    }

    #[tokio::test]
    async fn saved_results_are_searchable() {
        let idx = LanguageIndex::in_memory("python", None).await.unwrap();
        let r = vec![SearchResult::new("asyncio gather", "https://docs", "run coroutines concurrently")];
        assert_eq!(save_to_index(&idx, &r, "parallel coroutines").await.unwrap(), 1);
        let hits = idx.search("coroutines concurrently", None, 3, None).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
