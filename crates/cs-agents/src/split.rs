//! Distributed fallback for generations that miss their deadline.
//!
//! The timed-out description is cut into chunks (the analysed feature list
//! when there is one, sentence groups otherwise), each chunk is generated by
//! a peer worker in parallel, and the results are merged in chunk order with
//! exact duplicates elided.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use cs_bridge::{BusKind, EventBus};
use cs_core::config::SplitConfig;
use cs_core::types::Task;
use cs_telemetry::metrics::PlatformMetrics;

// ---------------------------------------------------------------------------
// Pool seam
// ---------------------------------------------------------------------------

/// The peers a split can fan out to. Implemented by the agent registry.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Every language the pool can serve, with its number of active tasks.
    fn languages_by_load(&self) -> Vec<(String, usize)>;

    /// Run analysis and generation only for `description`. The returned
    /// task carries its own errors; it never re-splits.
    async fn generate_only(
        &self,
        language: &str,
        description: &str,
        depth: u32,
        timeout: Duration,
    ) -> Task;
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("fallback depth {depth} reached the maximum of {max}")]
    DepthExceeded { depth: u32, max: u32 },
    #[error("no peer workers available")]
    NoWorkers,
    #[error("worker pool is gone")]
    PoolGone,
}

#[derive(Debug, Clone, Default)]
pub struct SplitRequest {
    pub description: String,
    pub features: Vec<String>,
    pub preferred: Option<String>,
    pub excluded: Option<String>,
    /// Depth of the task that timed out; subtasks run at `depth + 1`.
    pub depth: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitPart {
    pub index: usize,
    pub language: String,
    pub success: bool,
    pub code: String,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitOutcome {
    pub success: bool,
    pub combined_code: String,
    pub parts: Vec<SplitPart>,
    pub depth: u32,
}

// ---------------------------------------------------------------------------
// Chunking and merge
// ---------------------------------------------------------------------------

fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        let boundary = matches!(c, '.' | '!' | '?' | '\n')
            && chars.peek().map_or(true, |n| n.is_whitespace());
        if boundary {
            let s = current.trim();
            if !s.is_empty() {
                out.push(s.to_string());
            }
            current.clear();
        }
    }
    let s = current.trim();
    if !s.is_empty() {
        out.push(s.to_string());
    }
    out
}

/// Features when present, otherwise sentences dealt round-robin into at most
/// `max_workers` groups.
pub fn chunk_description(description: &str, features: &[String], max_workers: usize) -> Vec<String> {
    let features: Vec<String> = features
        .iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();
    if !features.is_empty() {
        return features;
    }
    let parts = sentences(description);
    if parts.is_empty() {
        return Vec::new();
    }
    let groups = max_workers.max(1).min(parts.len());
    let mut buckets: Vec<Vec<String>> = vec![Vec::new(); groups];
    for (i, sentence) in parts.into_iter().enumerate() {
        buckets[i % groups].push(sentence);
    }
    buckets.into_iter().map(|b| b.join(" ")).collect()
}

/// Least loaded first; ties keep pool order. `preferred` moves to the head
/// unless it is also excluded.
pub fn order_languages(
    mut loads: Vec<(String, usize)>,
    preferred: Option<&str>,
    excluded: Option<&str>,
) -> Vec<String> {
    loads.retain(|(lang, _)| Some(lang.as_str()) != excluded);
    loads.sort_by_key(|(_, load)| *load);
    let mut ordered: Vec<String> = loads.into_iter().map(|(lang, _)| lang).collect();
    if let Some(pref) = preferred {
        if Some(pref) != excluded {
            ordered.retain(|l| l != pref);
            ordered.insert(0, pref.to_string());
        }
    }
    ordered
}

pub fn chunk_header(index: usize, language: &str) -> String {
    format!("# --- chunk {index} ({language}) ---")
}

/// Concatenate non-empty parts in index order, skipping exact repeats.
pub fn merge_parts(parts: &[SplitPart]) -> String {
    let mut ordered: Vec<&SplitPart> = parts.iter().collect();
    ordered.sort_by_key(|p| p.index);
    let mut seen = HashSet::new();
    let mut sections = Vec::new();
    for part in ordered {
        let code = part.code.trim();
        if code.is_empty() || !seen.insert(code.to_string()) {
            continue;
        }
        sections.push(format!("{}\n{}", chunk_header(part.index, &part.language), code));
    }
    sections.join("\n\n")
}

// ---------------------------------------------------------------------------
// SplitExecutor
// ---------------------------------------------------------------------------

pub struct SplitExecutor {
    pool: Weak<dyn WorkerPool>,
    config: SplitConfig,
    bus: EventBus,
}

impl SplitExecutor {
    pub fn new(pool: Weak<dyn WorkerPool>, config: SplitConfig, bus: EventBus) -> Self {
        Self { pool, config, bus }
    }

    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    pub async fn run(&self, request: SplitRequest) -> Result<SplitOutcome, SplitError> {
        if request.depth >= self.config.max_fallback_depth {
            return Err(SplitError::DepthExceeded {
                depth: request.depth,
                max: self.config.max_fallback_depth,
            });
        }
        let pool = self.pool.upgrade().ok_or(SplitError::PoolGone)?;

        let chunks = chunk_description(&request.description, &request.features, self.config.max_workers);
        let mut languages = order_languages(
            pool.languages_by_load(),
            request.preferred.as_deref(),
            request.excluded.as_deref(),
        );
        if languages.is_empty() {
            // exclusion left nothing; the origin is better than no peer
            languages = request.excluded.iter().cloned().collect();
        }
        if chunks.is_empty() || languages.is_empty() {
            return Err(SplitError::NoWorkers);
        }

        let depth = request.depth + 1;
        let timeout = Duration::from_secs(self.config.subtask_timeout_secs);
        info!(chunks = chunks.len(), depth, "splitting task across peers");
        self.bus.publish(
            BusKind::Coordinator,
            "split",
            None,
            json!({
                "action": "split",
                "chunks": chunks.len(),
                "languages": languages,
                "depth": depth,
            }),
            None,
        );

        let handles: Vec<_> = chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let language = languages[index % languages.len()].clone();
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    // the worker enforces the deadline on its own LLM call; this
                    // bounds the whole subtask
                    let task = tokio::time::timeout(
                        timeout + Duration::from_secs(1),
                        pool.generate_only(&language, &chunk, depth, timeout),
                    )
                    .await;
                    match task {
                        Ok(task) => SplitPart {
                            index,
                            success: task.is_success() && !task.code.trim().is_empty(),
                            code: task.code,
                            errors: task.errors,
                            language,
                        },
                        Err(_) => SplitPart {
                            index,
                            language,
                            success: false,
                            code: String::new(),
                            errors: vec![format!("subtask timed out after {}s", timeout.as_secs())],
                        },
                    }
                })
            })
            .collect();

        let mut parts = Vec::with_capacity(handles.len());
        for (index, joined) in futures::future::join_all(handles).await.into_iter().enumerate() {
            match joined {
                Ok(part) => parts.push(part),
                Err(err) => {
                    warn!(index, error = %err, "split subtask panicked");
                    parts.push(SplitPart {
                        index,
                        language: String::new(),
                        success: false,
                        code: String::new(),
                        errors: vec![err.to_string()],
                    });
                }
            }
        }

        let combined_code = merge_parts(&parts);
        let success = !combined_code.trim().is_empty();
        PlatformMetrics::split_run(success);
        info!(
            success,
            succeeded = parts.iter().filter(|p| p.success).count(),
            total = parts.len(),
            "split finished"
        );
        Ok(SplitOutcome {
            success,
            combined_code,
            parts,
            depth,
        })
    }
}

impl std::fmt::Debug for SplitExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitExecutor")
            .field("config", &self.config)
            .finish()
    }
}
