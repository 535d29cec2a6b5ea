//! Durable store of past (failure context → decision → outcome) tuples.
//!
//! Records are append-only. The only mutation is a single outcome patch,
//! implemented as a conditional update on `outcome = 'pending'` so a second
//! patch is a no-op even under concurrent writers.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_rusqlite::Connection;

use crate::clock::{Clock, SystemClock};

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("database: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("confidence must be within [0, 1], got {0}")]
    InvalidConfidence(f64),
    #[error("outcome patch must be success or failure")]
    PendingPatch,
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MemoryError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Success,
    Failure,
}

impl Outcome {
    fn as_sql(&self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }

    fn from_sql(raw: &str) -> Self {
        match raw {
            "success" => Outcome::Success,
            "failure" => Outcome::Failure,
            _ => Outcome::Pending,
        }
    }

    /// Historical success weight used by recall ranking.
    fn weight(&self) -> f64 {
        match self {
            Outcome::Success => 1.0,
            Outcome::Pending => 0.6,
            Outcome::Failure => 0.3,
        }
    }
}

/// Context key a decision is filed under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionContext {
    pub application: String,
    pub component: String,
    pub error_kind: String,
    pub error_message: String,
}

impl DecisionContext {
    pub fn new(
        application: impl Into<String>,
        component: impl Into<String>,
        error_kind: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            application: application.into(),
            component: component.into(),
            error_kind: error_kind.into(),
            error_message: error_message.into(),
        }
    }

    /// `sha256(kind:normalized_message)[:16]`.
    ///
    /// Application and component are not hashed. Digits are stripped from
    /// the message so line numbers and ports do not split otherwise
    /// identical failures.
    pub fn signature(&self) -> String {
        let normalized: String = self
            .error_message
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_ascii_digit())
            .take(200)
            .collect();
        hex16(format!("{}:{}", self.error_kind, normalized).as_bytes())
    }
}

fn hex16(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{digest:x}")[..16].to_string()
}

#[derive(Debug, Clone)]
pub struct NewDecision {
    pub context: DecisionContext,
    pub decision_kind: String,
    pub decision: String,
    pub reasoning: String,
    pub confidence: f64,
    pub context_data: serde_json::Value,
}

impl NewDecision {
    pub fn new(
        context: DecisionContext,
        decision_kind: impl Into<String>,
        decision: impl Into<String>,
    ) -> Self {
        Self {
            context,
            decision_kind: decision_kind.into(),
            decision: decision.into(),
            reasoning: String::new(),
            confidence: 0.5,
            context_data: serde_json::Value::Null,
        }
    }

    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn context_data(mut self, data: serde_json::Value) -> Self {
        self.context_data = data;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: i64,
    pub context: DecisionContext,
    pub error_signature: String,
    pub decision_kind: String,
    pub decision: String,
    pub reasoning: String,
    pub confidence: f64,
    pub outcome: Outcome,
    pub outcome_details: Option<serde_json::Value>,
    pub feedback_score: Option<f64>,
    pub context_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionStats {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub pending: u64,
    pub avg_confidence: f64,
    pub avg_feedback: Option<f64>,
}

impl DecisionStats {
    pub fn success_rate(&self) -> f64 {
        let decided = self.successes + self.failures;
        if decided == 0 {
            0.0
        } else {
            self.successes as f64 / decided as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub pattern_kind: String,
    pub signature: String,
    pub data: serde_json::Value,
    pub occurrences: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub confidence: f64,
    pub last_seen_at: DateTime<Utc>,
}

/// A recalled record with the score it was ranked by.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredDecision {
    pub record: DecisionRecord,
    pub score: f64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct DecisionMemory {
    conn: Connection,
    clock: Arc<dyn Clock>,
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

const RECORD_COLUMNS: &str = "id, application, component, error_kind, error_message, \
     error_signature, decision_kind, decision, reasoning, confidence, outcome, \
     outcome_details, feedback_score, context_data, created_at, updated_at";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<DecisionRecord> {
    let outcome: String = row.get(10)?;
    let details: Option<String> = row.get(11)?;
    let context_data: Option<String> = row.get(13)?;
    let created: String = row.get(14)?;
    let updated: String = row.get(15)?;
    Ok(DecisionRecord {
        id: row.get(0)?,
        context: DecisionContext {
            application: row.get(1)?,
            component: row.get(2)?,
            error_kind: row.get(3)?,
            error_message: row.get(4)?,
        },
        error_signature: row.get(5)?,
        decision_kind: row.get(6)?,
        decision: row.get(7)?,
        reasoning: row.get(8)?,
        confidence: row.get(9)?,
        outcome: Outcome::from_sql(&outcome),
        outcome_details: details.and_then(|d| serde_json::from_str(&d).ok()),
        feedback_score: row.get(12)?,
        context_data: context_data
            .and_then(|d| serde_json::from_str(&d).ok())
            .unwrap_or(serde_json::Value::Null),
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}

impl DecisionMemory {
    /// Open (or create) a store at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        Self::with_connection(conn, SystemClock::shared()).await
    }

    /// In-memory store for tests.
    pub async fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::with_connection(conn, SystemClock::shared()).await
    }

    pub async fn in_memory_with_clock(clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::with_connection(conn, clock).await
    }

    async fn with_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        let memory = Self { conn, clock };
        memory.init_schema().await?;
        Ok(memory)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS decisions (
                        id              INTEGER PRIMARY KEY AUTOINCREMENT,
                        application     TEXT NOT NULL,
                        component       TEXT NOT NULL,
                        error_kind      TEXT NOT NULL,
                        error_message   TEXT NOT NULL,
                        error_signature TEXT NOT NULL,
                        decision_kind   TEXT NOT NULL,
                        decision        TEXT NOT NULL,
                        reasoning       TEXT NOT NULL DEFAULT '',
                        confidence      REAL NOT NULL DEFAULT 0.5,
                        outcome         TEXT NOT NULL DEFAULT 'pending',
                        outcome_details TEXT,
                        feedback_score  REAL,
                        context_data    TEXT,
                        created_at      TEXT NOT NULL,
                        updated_at      TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_decisions_app_comp
                        ON decisions(application, component);
                    CREATE INDEX IF NOT EXISTS idx_decisions_signature
                        ON decisions(error_signature);
                    CREATE INDEX IF NOT EXISTS idx_decisions_created
                        ON decisions(created_at DESC);

                    CREATE TABLE IF NOT EXISTS learned_patterns (
                        signature     TEXT PRIMARY KEY,
                        pattern_kind  TEXT NOT NULL,
                        data          TEXT NOT NULL,
                        occurrences   INTEGER NOT NULL DEFAULT 1,
                        success_count INTEGER NOT NULL DEFAULT 0,
                        failure_count INTEGER NOT NULL DEFAULT 0,
                        confidence    REAL NOT NULL DEFAULT 0.5,
                        last_seen_at  TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Decisions
    // -----------------------------------------------------------------------

    /// Append a decision with outcome `pending`. Returns its id.
    pub async fn record(&self, decision: NewDecision) -> Result<i64> {
        if !(0.0..=1.0).contains(&decision.confidence) || decision.confidence.is_nan() {
            return Err(MemoryError::InvalidConfidence(decision.confidence));
        }
        let signature = decision.context.signature();
        let context_data = serde_json::to_string(&decision.context_data)?;
        let now = ts(self.clock.now());

        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO decisions (application, component, error_kind, error_message,
                        error_signature, decision_kind, decision, reasoning, confidence,
                        outcome, context_data, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10, ?11, ?11)",
                    rusqlite::params![
                        decision.context.application,
                        decision.context.component,
                        decision.context.error_kind,
                        decision.context.error_message,
                        signature,
                        decision.decision_kind,
                        decision.decision,
                        decision.reasoning,
                        decision.confidence,
                        context_data,
                        now,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        tracing::debug!(id, "decision recorded");
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<DecisionRecord>> {
        let record = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {RECORD_COLUMNS} FROM decisions WHERE id = ?1");
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_record(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(record)
    }

    /// Patch the outcome of a pending decision.
    ///
    /// Returns `true` when this call applied the patch, `false` when the
    /// record was already patched or does not exist.
    pub async fn patch_outcome(
        &self,
        id: i64,
        outcome: Outcome,
        details: Option<serde_json::Value>,
        feedback_score: Option<f64>,
    ) -> Result<bool> {
        if outcome == Outcome::Pending {
            return Err(MemoryError::PendingPatch);
        }
        let details = details.map(|d| serde_json::to_string(&d)).transpose()?;
        let now = ts(self.clock.now());

        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE decisions
                        SET outcome = ?1, outcome_details = ?2, feedback_score = ?3, updated_at = ?4
                      WHERE id = ?5 AND outcome = 'pending'",
                    rusqlite::params![outcome.as_sql(), details, feedback_score, now, id],
                )?;
                Ok(changed)
            })
            .await?;

        if changed == 0 {
            tracing::debug!(id, "outcome patch ignored");
        }
        Ok(changed > 0)
    }

    /// Recall decisions similar to `context`, best first.
    ///
    /// Score is `similarity × recency × outcome weight`; ties go to the
    /// newer record.
    pub async fn recall(&self, context: &DecisionContext, limit: usize) -> Result<Vec<DecisionRecord>> {
        Ok(self
            .recall_scored(context, limit)
            .await?
            .into_iter()
            .map(|s| s.record)
            .collect())
    }

    pub async fn recall_scored(
        &self,
        context: &DecisionContext,
        limit: usize,
    ) -> Result<Vec<ScoredDecision>> {
        let app = context.application.clone();
        let comp = context.component.clone();
        let signature = context.signature();

        let candidates = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM decisions
                      WHERE application = ?1 OR component = ?2 OR error_signature = ?3
                      ORDER BY created_at DESC, id DESC
                      LIMIT 500"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params![app, comp, signature])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_record(row)?);
                }
                Ok(out)
            })
            .await?;

        let now = self.clock.now();
        let mut scored: Vec<ScoredDecision> = candidates
            .into_iter()
            .filter_map(|record| {
                let similarity = similarity(context, &record.context);
                if similarity <= 0.0 {
                    return None;
                }
                let age_days = (now - record.created_at).num_seconds().max(0) as f64 / 86_400.0;
                let recency = 1.0 / (1.0 + age_days / 30.0);
                let score = similarity * recency * record.outcome.weight();
                Some(ScoredDecision { record, score })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.record.created_at.cmp(&a.record.created_at))
                .then_with(|| b.record.id.cmp(&a.record.id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// Top-K recalled decisions with negatively rated ones (feedback ≤ -1)
    /// moved behind the rest.
    pub async fn recommend(&self, context: &DecisionContext, top_k: usize) -> Result<Vec<DecisionRecord>> {
        let recalled = self.recall(context, top_k).await?;
        let (demoted, kept): (Vec<_>, Vec<_>) = recalled
            .into_iter()
            .partition(|r| r.feedback_score.is_some_and(|f| f <= -1.0));
        Ok(kept.into_iter().chain(demoted).collect())
    }

    pub async fn stats(&self, application: Option<&str>, window_days: u32) -> Result<DecisionStats> {
        let cutoff = ts(self.clock.now() - ChronoDuration::days(i64::from(window_days)));
        let app = application.map(str::to_string);

        let stats = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN outcome = 'success' THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN outcome = 'failure' THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN outcome = 'pending' THEN 1 ELSE 0 END), 0),
                            COALESCE(AVG(confidence), 0.0),
                            AVG(feedback_score)
                       FROM decisions
                      WHERE created_at >= ?1 AND (?2 IS NULL OR application = ?2)",
                )?;
                let stats = stmt.query_row(rusqlite::params![cutoff, app], |row| {
                    Ok(DecisionStats {
                        total: row.get::<_, i64>(0)? as u64,
                        successes: row.get::<_, i64>(1)? as u64,
                        failures: row.get::<_, i64>(2)? as u64,
                        pending: row.get::<_, i64>(3)? as u64,
                        avg_confidence: row.get(4)?,
                        avg_feedback: row.get(5)?,
                    })
                })?;
                Ok(stats)
            })
            .await?;
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Learned patterns
    // -----------------------------------------------------------------------

    /// Count one more application of a pattern and refresh its confidence
    /// (`successes / (successes + failures)`).
    pub async fn learn_pattern(
        &self,
        pattern_kind: &str,
        data: &serde_json::Value,
        success: bool,
    ) -> Result<String> {
        let encoded = serde_json::to_string(data)?;
        let signature = hex16(format!("{pattern_kind}:{encoded}").as_bytes());
        let kind = pattern_kind.to_string();
        let sig = signature.clone();
        let now = ts(self.clock.now());
        let (s, f): (i64, i64) = if success { (1, 0) } else { (0, 1) };

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO learned_patterns
                        (signature, pattern_kind, data, occurrences, success_count, failure_count,
                         confidence, last_seen_at)
                     VALUES (?1, ?2, ?3, 1, ?4, ?5, CAST(?4 AS REAL), ?6)
                     ON CONFLICT(signature) DO UPDATE SET
                        occurrences   = occurrences + 1,
                        success_count = success_count + ?4,
                        failure_count = failure_count + ?5,
                        confidence    = CAST(success_count + ?4 AS REAL)
                                        / (success_count + ?4 + failure_count + ?5),
                        last_seen_at  = ?6",
                    rusqlite::params![sig, kind, encoded, s, f, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(signature)
    }

    pub async fn learned_patterns(
        &self,
        pattern_kind: Option<&str>,
        min_confidence: f64,
        limit: usize,
    ) -> Result<Vec<LearnedPattern>> {
        let kind = pattern_kind.map(str::to_string);
        let limit = limit as i64;
        let patterns = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT pattern_kind, signature, data, occurrences, success_count,
                            failure_count, confidence, last_seen_at
                       FROM learned_patterns
                      WHERE confidence >= ?1 AND (?2 IS NULL OR pattern_kind = ?2)
                      ORDER BY confidence DESC, occurrences DESC
                      LIMIT ?3",
                )?;
                let mut rows = stmt.query(rusqlite::params![min_confidence, kind, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let data: String = row.get(2)?;
                    let last_seen: String = row.get(7)?;
                    out.push(LearnedPattern {
                        pattern_kind: row.get(0)?,
                        signature: row.get(1)?,
                        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
                        occurrences: row.get::<_, i64>(3)? as u64,
                        success_count: row.get::<_, i64>(4)? as u64,
                        failure_count: row.get::<_, i64>(5)? as u64,
                        confidence: row.get(6)?,
                        last_seen_at: parse_ts(&last_seen),
                    });
                }
                Ok(out)
            })
            .await?;
        Ok(patterns)
    }
}

// ---------------------------------------------------------------------------
// Similarity
// ---------------------------------------------------------------------------

/// Exact match on application/component plus case-insensitive substring
/// (or word) overlap on the error kind and message. Range `[0, 1]`.
pub fn similarity(query: &DecisionContext, stored: &DecisionContext) -> f64 {
    let mut score = 0.0;
    if !query.application.is_empty() && query.application == stored.application {
        score += 0.25;
    }
    if !query.component.is_empty() && query.component == stored.component {
        score += 0.25;
    }
    score += 0.25 * text_overlap(&query.error_kind, &stored.error_kind);
    score += 0.25 * text_overlap(&query.error_message, &stored.error_message);
    score
}

fn text_overlap(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a.contains(&b) || b.contains(&a) {
        return 1.0;
    }
    let words_a: std::collections::HashSet<&str> = a.split_whitespace().collect();
    let words_b: std::collections::HashSet<&str> = b.split_whitespace().collect();
    let shared = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    if union == 0 {
        0.0
    } else {
        shared as f64 / union as f64
    }
}
