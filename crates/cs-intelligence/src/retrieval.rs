//! Per-language knowledge store used to augment generation prompts.
//!
//! Each language gets its own sqlite database under
//! `RETRIEVAL_DIR/<language>/index.db`. Text is split into overlapping
//! chunks; chunk ids are content hashes (or `{source_id}_{i}`), so
//! re-indexing the same content upserts instead of duplicating.
//!
//! Scoring is cosine similarity when an [`Embedder`] is configured and the
//! chunk has a stored vector, keyword overlap otherwise.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_rusqlite::Connection;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("database: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("embedding: {0}")]
    Embedding(String),
}

pub type Result<T> = std::result::Result<T, RetrievalError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Code,
    Documentation,
    Conversation,
    Research,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Code => "code",
            DocType::Documentation => "documentation",
            DocType::Conversation => "conversation",
            DocType::Research => "research",
        }
    }

    fn from_sql(raw: &str) -> Self {
        match raw {
            "documentation" => DocType::Documentation,
            "conversation" => DocType::Conversation,
            "research" => DocType::Research,
            _ => DocType::Code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    pub size: usize,
    pub overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            size: 1500,
            overlap: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    pub doc_type: DocType,
    pub metadata: Map<String, Value>,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub language: String,
    pub total_chunks: usize,
    pub by_type: BTreeMap<String, usize>,
    pub embedded_chunks: usize,
    pub embedder: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredChunk {
    id: String,
    content: String,
    doc_type: DocType,
    source_id: Option<String>,
    metadata: Map<String, Value>,
    embedding: Option<Vec<f32>>,
}

// ---------------------------------------------------------------------------
// Embedder
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn name(&self) -> &str;
}

/// `POST {base}/api/embeddings` on an Ollama-compatible server.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let resp = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&serde_json::json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(RetrievalError::Embedding(format!(
                "status {}",
                resp.status().as_u16()
            )));
        }
        let body: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;
        if body.embedding.is_empty() {
            return Err(RetrievalError::Embedding("empty embedding".into()));
        }
        Ok(body.embedding)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Chunking and scoring helpers
// ---------------------------------------------------------------------------

/// First 16 hex chars of the SHA-256 of `content`.
pub fn content_id(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Split `text` into windows of `cfg.size` chars overlapping by
/// `cfg.overlap`. A window that does not reach the end of the text is cut
/// at its last newline when that newline lies past the window midpoint.
/// Chunks are trimmed; blank chunks are dropped.
pub fn chunk_text(text: &str, cfg: ChunkConfig) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let size = cfg.size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let mut end = (start + size).min(chars.len());
        if end < chars.len() {
            if let Some(pos) = chars[start..end].iter().rposition(|c| *c == '\n') {
                if pos > size / 2 {
                    end = start + pos;
                }
            }
        }
        let chunk: String = chars[start..end].iter().collect();
        let trimmed = chunk.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }
        if end >= chars.len() {
            break;
        }
        let next = end.saturating_sub(cfg.overlap);
        start = if next > start { next } else { end };
    }
    chunks
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.chars().count() >= 2)
        .map(str::to_lowercase)
        .collect()
}

/// Fraction of query terms present in `content`, plus a bonus when the
/// whole query appears verbatim.
fn keyword_score(query_terms: &HashSet<String>, query: &str, content: &str) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let content_terms = terms(content);
    let hits = query_terms
        .iter()
        .filter(|t| content_terms.contains(*t))
        .count();
    let mut score = hits as f64 / query_terms.len() as f64;
    let q = query.trim().to_lowercase();
    if q.len() > 3 && content.to_lowercase().contains(&q) {
        score += 0.5;
    }
    score
}

pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64).powi(2);
        nb += (*y as f64).powi(2);
    }
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ---------------------------------------------------------------------------
// LanguageIndex
// ---------------------------------------------------------------------------

/// The store for one language.
pub struct LanguageIndex {
    language: String,
    conn: Connection,
    embedder: Option<Arc<dyn Embedder>>,
    chunking: ChunkConfig,
}

impl LanguageIndex {
    pub async fn open(
        root: impl AsRef<Path>,
        language: &str,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Self> {
        let dir = root.as_ref().join(language);
        tokio::fs::create_dir_all(&dir).await?;
        let conn = Connection::open(dir.join("index.db")).await?;
        Self::with_connection(conn, language, embedder).await
    }

    pub async fn in_memory(language: &str, embedder: Option<Arc<dyn Embedder>>) -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::with_connection(conn, language, embedder).await
    }

    async fn with_connection(
        conn: Connection,
        language: &str,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode=WAL;
                PRAGMA busy_timeout=5000;

                CREATE TABLE IF NOT EXISTS chunks (
                    id         TEXT PRIMARY KEY,
                    content    TEXT NOT NULL,
                    doc_type   TEXT NOT NULL,
                    source_id  TEXT,
                    metadata   TEXT NOT NULL DEFAULT '{}',
                    embedding  TEXT,
                    indexed_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_chunks_type ON chunks(doc_type);
                CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source_id);
                ",
            )?;
            Ok(())
        })
        .await?;
        Ok(Self {
            language: language.to_string(),
            conn,
            embedder,
            chunking: ChunkConfig::default(),
        })
    }

    pub fn with_chunking(mut self, chunking: ChunkConfig) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(text).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(language = %self.language, error = %e, "embedding failed, storing without vector");
                None
            }
        }
    }

    async fn upsert(&self, chunks: Vec<StoredChunk>) -> Result<usize> {
        let now = now_iso();
        let rows = chunks
            .into_iter()
            .map(|c| {
                Ok((
                    c.id,
                    c.content,
                    c.doc_type.as_str(),
                    c.source_id,
                    serde_json::to_string(&c.metadata)?,
                    c.embedding.map(|e| serde_json::to_string(&e)).transpose()?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let count = rows.len();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO chunks (id, content, doc_type, source_id, metadata, embedding, indexed_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                         ON CONFLICT(id) DO UPDATE SET
                            content = excluded.content,
                            doc_type = excluded.doc_type,
                            source_id = excluded.source_id,
                            metadata = excluded.metadata,
                            embedding = COALESCE(excluded.embedding, chunks.embedding),
                            indexed_at = excluded.indexed_at",
                    )?;
                    for (id, content, doc_type, source_id, metadata, embedding) in rows {
                        stmt.execute(rusqlite::params![
                            id, content, doc_type, source_id, metadata, embedding, now
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(count)
    }

    fn base_metadata(&self, doc_type: DocType, extra: Option<Map<String, Value>>) -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert("language".into(), Value::String(self.language.clone()));
        meta.insert("type".into(), Value::String(doc_type.as_str().into()));
        meta.insert("indexed_at".into(), Value::String(now_iso()));
        if let Some(extra) = extra {
            meta.extend(extra);
        }
        meta
    }

    /// Index a code sample. Returns the number of chunks written.
    pub async fn index_code(
        &self,
        code: &str,
        description: &str,
        source_id: Option<&str>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<usize> {
        let chunks = chunk_text(code, self.chunking);
        let total = chunks.len();
        let mut stored = Vec::with_capacity(total);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let id = match source_id {
                Some(src) => format!("{src}_{i}"),
                None => content_id(&chunk),
            };
            let mut meta = self.base_metadata(DocType::Code, metadata.clone());
            meta.insert("description".into(), Value::String(truncate_chars(description, 500).into()));
            meta.insert("chunk_index".into(), Value::from(i));
            meta.insert("total_chunks".into(), Value::from(total));
            if let Some(src) = source_id {
                meta.insert("source_id".into(), Value::String(src.into()));
            }
            let embedding = self.embed(&chunk).await;
            stored.push(StoredChunk {
                id,
                content: chunk,
                doc_type: DocType::Code,
                source_id: source_id.map(str::to_string),
                metadata: meta,
                embedding,
            });
        }
        let n = self.upsert(stored).await?;
        debug!(language = %self.language, chunks = n, "indexed code");
        Ok(n)
    }

    pub async fn index_documentation(
        &self,
        content: &str,
        title: &str,
        source: Option<&str>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<usize> {
        self.index_text(DocType::Documentation, content, title, source, metadata)
            .await
    }

    /// Web-research snippets share the documentation layout under their
    /// own type.
    pub async fn index_research(
        &self,
        content: &str,
        title: &str,
        source: Option<&str>,
    ) -> Result<usize> {
        self.index_text(DocType::Research, content, title, source, None)
            .await
    }

    async fn index_text(
        &self,
        doc_type: DocType,
        content: &str,
        title: &str,
        source: Option<&str>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<usize> {
        let chunks = chunk_text(content, self.chunking);
        let total = chunks.len();
        let mut stored = Vec::with_capacity(total);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let id = content_id(&format!("{title}_{i}_{}", truncate_chars(&chunk, 50)));
            let mut meta = self.base_metadata(doc_type, metadata.clone());
            meta.insert("title".into(), Value::String(title.into()));
            meta.insert("chunk_index".into(), Value::from(i));
            meta.insert("total_chunks".into(), Value::from(total));
            if let Some(src) = source {
                meta.insert("source".into(), Value::String(src.into()));
            }
            let embedding = self.embed(&chunk).await;
            stored.push(StoredChunk {
                id,
                content: chunk,
                doc_type,
                source_id: source.map(str::to_string),
                metadata: meta,
                embedding,
            });
        }
        self.upsert(stored).await
    }

    /// Index a question/answer exchange as a single chunk.
    pub async fn index_conversation(
        &self,
        question: &str,
        answer: &str,
        context: Option<&str>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<usize> {
        let mut content = format!("QUESTION: {question}\n\nANSWER: {answer}");
        if let Some(ctx) = context.filter(|c| !c.is_empty()) {
            content = format!("CONTEXT: {ctx}\n\n{content}");
        }
        let mut meta = self.base_metadata(DocType::Conversation, metadata);
        meta.insert("question".into(), Value::String(truncate_chars(question, 500).into()));
        let embedding = self.embed(&content).await;
        self.upsert(vec![StoredChunk {
            id: content_id(&content),
            content,
            doc_type: DocType::Conversation,
            source_id: None,
            metadata: meta,
            embedding,
        }])
        .await
    }

    async fn load(&self, doc_type: Option<DocType>) -> Result<Vec<StoredChunk>> {
        let filter = doc_type.map(|t| t.as_str().to_string());
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, content, doc_type, source_id, metadata, embedding
                       FROM chunks
                      WHERE (?1 IS NULL OR doc_type = ?1)
                      ORDER BY indexed_at DESC, id",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![filter], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, Option<String>>(5)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, content, doc_type, source_id, metadata, embedding)| {
                Ok(StoredChunk {
                    id,
                    content,
                    doc_type: DocType::from_sql(&doc_type),
                    source_id,
                    metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                    embedding: embedding.and_then(|e| serde_json::from_str(&e).ok()),
                })
            })
            .collect()
    }

    /// Best `n` chunks for `query`, highest score first.
    pub async fn search_with_metadata(
        &self,
        query: &str,
        n: usize,
        doc_type: Option<DocType>,
        language: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let chunks = self.load(doc_type).await?;
        let query_vec = self.embed(query).await;
        let query_terms = terms(query);

        let mut hits: Vec<SearchHit> = chunks
            .into_iter()
            .filter(|c| match language {
                Some(lang) => c.metadata.get("language").and_then(Value::as_str) == Some(lang),
                None => true,
            })
            .filter_map(|c| {
                let score = match (&query_vec, &c.embedding) {
                    (Some(q), Some(e)) => cosine(q, e),
                    _ => keyword_score(&query_terms, query, &c.content),
                };
                (score > 0.0).then(|| SearchHit {
                    id: c.id,
                    content: c.content,
                    doc_type: c.doc_type,
                    metadata: c.metadata,
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(n);
        Ok(hits)
    }

    pub async fn search(
        &self,
        query: &str,
        language: Option<&str>,
        n: usize,
        doc_type: Option<DocType>,
    ) -> Result<Vec<String>> {
        Ok(self
            .search_with_metadata(query, n, doc_type, language)
            .await?
            .into_iter()
            .map(|h| h.content)
            .collect())
    }

    /// Numbered snippets separated by `---`, or an empty string when
    /// nothing matches.
    pub async fn context_for_prompt(&self, query: &str, n: usize) -> Result<String> {
        let hits = self.search_with_metadata(query, n, None, None).await?;
        Ok(format_context(&hits))
    }

    pub async fn delete_by_source(&self, source_id: &str) -> Result<usize> {
        let source = source_id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM chunks WHERE source_id = ?1",
                    rusqlite::params![source],
                )?)
            })
            .await?;
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        let (by_type, embedded) = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT doc_type, COUNT(*) FROM chunks GROUP BY doc_type")?;
                let by_type = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let embedded: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL",
                    [],
                    |row| row.get(0),
                )?;
                Ok((by_type, embedded))
            })
            .await?;
        let by_type: BTreeMap<String, usize> = by_type
            .into_iter()
            .map(|(k, v)| (k, v.max(0) as usize))
            .collect();
        Ok(IndexStats {
            language: self.language.clone(),
            total_chunks: by_type.values().sum(),
            by_type,
            embedded_chunks: embedded.max(0) as usize,
            embedder: self.embedder.as_ref().map(|e| e.name().to_string()),
        })
    }

    /// Dump every chunk as JSON (used for backups).
    pub async fn export_json(&self) -> Result<Value> {
        let chunks = self.load(None).await?;
        Ok(serde_json::json!({
            "language": self.language,
            "exported_at": now_iso(),
            "chunks": chunks,
        }))
    }

    /// Load chunks produced by [`export_json`](Self::export_json).
    pub async fn import_json(&self, dump: &Value) -> Result<usize> {
        let chunks: Vec<StoredChunk> = serde_json::from_value(
            dump.get("chunks").cloned().unwrap_or(Value::Array(Vec::new())),
        )?;
        self.upsert(chunks).await
    }
}

/// `[i] (type):\n{content[..1000]}` blocks joined with `\n\n---\n\n`.
pub fn format_context(hits: &[SearchHit]) -> String {
    hits.iter()
        .enumerate()
        .map(|(i, hit)| {
            let doc_type = hit
                .metadata
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            format!("[{}] ({}):\n{}", i + 1, doc_type, truncate_chars(&hit.content, 1000))
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

// ---------------------------------------------------------------------------
// RetrievalIndex
// ---------------------------------------------------------------------------

/// Lazily opens one [`LanguageIndex`] per language and caches it.
pub struct RetrievalIndex {
    root: Option<PathBuf>,
    embedder: Option<Arc<dyn Embedder>>,
    indexes: DashMap<String, Arc<LanguageIndex>>,
    open_lock: tokio::sync::Mutex<()>,
}

impl RetrievalIndex {
    /// Persistent stores under `root`.
    pub fn new(root: impl Into<PathBuf>, embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self {
            root: Some(root.into()),
            embedder,
            indexes: DashMap::new(),
            open_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Every language store lives in memory.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            embedder: None,
            indexes: DashMap::new(),
            open_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub async fn for_language(&self, language: &str) -> Result<Arc<LanguageIndex>> {
        if let Some(idx) = self.indexes.get(language) {
            return Ok(idx.clone());
        }
        let _guard = self.open_lock.lock().await;
        if let Some(idx) = self.indexes.get(language) {
            return Ok(idx.clone());
        }
        let index = match &self.root {
            Some(root) => LanguageIndex::open(root, language, self.embedder.clone()).await?,
            None => LanguageIndex::in_memory(language, self.embedder.clone()).await?,
        };
        let index = Arc::new(index);
        self.indexes.insert(language.to_string(), index.clone());
        Ok(index)
    }

    pub fn languages(&self) -> Vec<String> {
        let mut langs: Vec<String> = self.indexes.iter().map(|e| e.key().clone()).collect();
        langs.sort();
        langs
    }

    /// Search every opened language store and merge by score.
    pub async fn global_search(&self, query: &str, n: usize) -> Result<Vec<SearchHit>> {
        let indexes: Vec<Arc<LanguageIndex>> =
            self.indexes.iter().map(|e| e.value().clone()).collect();
        let mut all = Vec::new();
        for idx in indexes {
            all.extend(idx.search_with_metadata(query, n, None, None).await?);
        }
        all.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        all.truncate(n);
        Ok(all)
    }
}

impl std::fmt::Debug for RetrievalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalIndex")
            .field("root", &self.root)
            .field("languages", &self.languages())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("  hello  ", ChunkConfig::default()), vec!["hello"]);
        assert!(chunk_text("   ", ChunkConfig::default()).is_empty());
    }

    #[test]
    fn chunks_overlap() {
        let text: String = (0..50).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let chunks = chunk_text(&text, ChunkConfig { size: 20, overlap: 5 });
        assert!(chunks.len() >= 3);
        assert_eq!(&chunks[0][15..20], &chunks[1][..5]);
    }

    #[test]
    fn chunks_prefer_late_newline() {
        let text = format!("{}\n{}", "a".repeat(15), "b".repeat(30));
        let chunks = chunk_text(&text, ChunkConfig { size: 20, overlap: 2 });
        assert_eq!(chunks[0], "a".repeat(15));
    }

    #[test]
    fn early_newline_is_ignored() {
        let text = format!("{}\n{}", "a".repeat(3), "b".repeat(40));
        let chunks = chunk_text(&text, ChunkConfig { size: 20, overlap: 2 });
        assert_eq!(chunks[0].chars().count(), 20);
    }

    #[test]
    fn overlap_not_smaller_than_size_still_terminates() {
        let chunks = chunk_text(&"x".repeat(100), ChunkConfig { size: 10, overlap: 10 });
        assert_eq!(chunks.len(), 10);
    }

    #[test]
    fn multibyte_text_chunks_safely() {
        let text = "ção ".repeat(500);
        let chunks = chunk_text(&text, ChunkConfig::default());
        assert!(!chunks.is_empty());
    }

    #[test]
    fn content_id_is_16_hex() {
        let id = content_id("abc");
        assert_eq!(id.len(), 16);
        assert_eq!(id, "ba7816bf8f01cfea");
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn index_code_twice_is_one_entry() {
        let idx = LanguageIndex::in_memory("python", None).await.unwrap();
        let code = "def add(a, b):\n    return a + b\n";
        idx.index_code(code, "add two numbers", None, None).await.unwrap();
        idx.index_code(code, "add two numbers", None, None).await.unwrap();
        let stats = idx.stats().await.unwrap();
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.by_type["code"], 1);
    }

    #[tokio::test]
    async fn keyword_search_ranks_relevant_first() {
        let idx = LanguageIndex::in_memory("python", None).await.unwrap();
        idx.index_code("def add(a, b):\n    return a + b", "sum", None, None)
            .await
            .unwrap();
        idx.index_documentation("HTTP servers with flask routes", "flask", None, None)
            .await
            .unwrap();
        let hits = idx.search_with_metadata("flask routes", 5, None, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_type, DocType::Documentation);

        let only_code = idx
            .search("flask routes", None, 5, Some(DocType::Code))
            .await
            .unwrap();
        assert!(only_code.is_empty());
    }

    #[tokio::test]
    async fn context_for_prompt_format() {
        let idx = LanguageIndex::in_memory("go", None).await.unwrap();
        idx.index_conversation("how to read stdin", "use bufio.Scanner", None, None)
            .await
            .unwrap();
        let ctx = idx.context_for_prompt("read stdin", 3).await.unwrap();
        assert!(ctx.starts_with("[1] (conversation):\n"));
        assert!(ctx.contains("bufio.Scanner"));
        assert_eq!(idx.context_for_prompt("zzzz qqqq", 3).await.unwrap(), "");
    }

    #[tokio::test]
    async fn delete_by_source_removes_chunks() {
        let idx = LanguageIndex::in_memory("rust", None).await.unwrap();
        idx.index_code("fn main() {}", "main", Some("task-1"), None)
            .await
            .unwrap();
        assert_eq!(idx.delete_by_source("task-1").await.unwrap(), 1);
        assert_eq!(idx.stats().await.unwrap().total_chunks, 0);
    }

    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(if text.contains("sort") {
                vec![1.0, 0.0]
            } else {
                vec![0.0, 1.0]
            })
        }
        fn name(&self) -> &str {
            "axis"
        }
    }

    #[tokio::test]
    async fn embedder_drives_scoring() {
        let idx = LanguageIndex::in_memory("python", Some(Arc::new(AxisEmbedder)))
            .await
            .unwrap();
        idx.index_code("sorted(xs)  # sort helper", "sort", None, None)
            .await
            .unwrap();
        idx.index_code("print('hi')", "greet", None, None).await.unwrap();
        let hits = idx.search_with_metadata("how to sort", 1, None, None).await.unwrap();
        assert!(hits[0].content.contains("sorted"));
        assert_eq!(idx.stats().await.unwrap().embedded_chunks, 2);
    }

    #[tokio::test]
    async fn export_import_roundtrip() {
        let a = LanguageIndex::in_memory("python", None).await.unwrap();
        a.index_code("x = 1", "assign", None, None).await.unwrap();
        let dump = a.export_json().await.unwrap();
        let b = LanguageIndex::in_memory("python", None).await.unwrap();
        assert_eq!(b.import_json(&dump).await.unwrap(), 1);
        assert_eq!(b.search("assign x", None, 5, None).await.unwrap(), vec!["x = 1"]);
    }
}
