//! Compare Cache Store
//! Mission: persist prior comparison results keyed by signature, and keep a
//! per-user search history. A single mutex-guarded SQLite connection gives
//! all writers effective serializability without a separate lock.

use crate::normalize::NormalizedProduct;
use crate::relevance::{Confidence, ScoredResult, Stats};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

const DEFAULT_TTL_HOURS: i64 = 24;
const LOOSE_FRESHNESS_HOURS: i64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    CacheStrict,
    CacheLoose,
    FreshFetch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareCacheEntry {
    pub id: i64,
    pub signature_strict: String,
    pub signature_loose: String,
    pub query_used: String,
    pub results: Vec<ScoredResult>,
    pub stats: Stats,
    pub confidence: Confidence,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct ResolveOutcome {
    pub entry: Option<CompareCacheEntry>,
    pub source: CacheSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHistoryRow {
    pub id: i64,
    pub user: String,
    pub created_at: DateTime<Utc>,
    pub domain: String,
    pub lot_url: Option<String>,
    pub raw_title: String,
    pub normalized: NormalizedProduct,
    pub signature_strict: String,
    pub signature_loose: String,
    pub source: CacheSource,
    pub cache_entry_id: Option<i64>,
    pub auction_price: Option<f64>,
    pub currency: Option<String>,
}

#[derive(Debug, Default)]
pub struct HistoryQuery {
    pub page: u32,
    pub page_size: u32,
    pub domain: Option<String>,
    pub source: Option<CacheSource>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

/// `grade==unknown` OR `confidence<0.5` — matches `canonical::ConditionGrade`.
pub fn should_allow_loose_lookup(grade: &str, confidence: f32) -> bool {
    grade == "unknown" || confidence < 0.5
}

pub struct CompareCacheStore {
    conn: Arc<Mutex<Connection>>,
}

impl CompareCacheStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub async fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS compare_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signature_strict TEXT UNIQUE NOT NULL,
                signature_loose TEXT NOT NULL,
                query_used TEXT NOT NULL,
                results_json TEXT NOT NULL,
                stats_json TEXT NOT NULL,
                confidence TEXT NOT NULL,
                fetched_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_compare_cache_loose ON compare_cache(signature_loose)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS search_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user TEXT NOT NULL,
                created_at TEXT NOT NULL,
                domain TEXT NOT NULL,
                lot_url TEXT,
                raw_title TEXT NOT NULL,
                normalized_json TEXT NOT NULL,
                signature_strict TEXT NOT NULL,
                signature_loose TEXT NOT NULL,
                source TEXT NOT NULL,
                cache_entry_id INTEGER,
                auction_price REAL,
                currency TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_search_history_user ON search_history(user, created_at DESC)",
            [],
        )?;
        Ok(())
    }

    /// Strict match first, then a freshness/confidence-gated loose match,
    /// else a fresh fetch is required.
    pub async fn resolve(
        &self,
        signature_strict: &str,
        signature_loose: &str,
        condition_grade: &str,
        condition_confidence: f32,
        force_refresh: bool,
    ) -> Result<ResolveOutcome> {
        if force_refresh {
            return Ok(ResolveOutcome {
                entry: None,
                source: CacheSource::FreshFetch,
            });
        }

        let conn = self.conn.lock().await;
        let now = Utc::now();

        if let Some(entry) = fetch_entry_by_signature(&conn, "signature_strict", signature_strict, now)? {
            return Ok(ResolveOutcome {
                entry: Some(entry),
                source: CacheSource::CacheStrict,
            });
        }

        if should_allow_loose_lookup(condition_grade, condition_confidence) {
            let freshness_cutoff = now - ChronoDuration::hours(LOOSE_FRESHNESS_HOURS);
            if let Some(entry) = fetch_loose_entry(&conn, signature_loose, now, freshness_cutoff)? {
                return Ok(ResolveOutcome {
                    entry: Some(entry),
                    source: CacheSource::CacheLoose,
                });
            }
        }

        Ok(ResolveOutcome {
            entry: None,
            source: CacheSource::FreshFetch,
        })
    }

    /// Upsert by `signature_strict`.
    pub async fn store(
        &self,
        signature_strict: &str,
        signature_loose: &str,
        query_used: &str,
        results: &[ScoredResult],
        stats: &Stats,
        confidence: Confidence,
        ttl_hours: Option<i64>,
    ) -> Result<CompareCacheEntry> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let expires_at = now + ChronoDuration::hours(ttl_hours.unwrap_or(DEFAULT_TTL_HOURS));

        let results_json = serde_json::to_string(results)?;
        let stats_json = serde_json::to_string(stats)?;
        let confidence_str = serde_json::to_string(&confidence)?;

        conn.execute(
            "INSERT INTO compare_cache
                (signature_strict, signature_loose, query_used, results_json, stats_json, confidence, fetched_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(signature_strict) DO UPDATE SET
                signature_loose = excluded.signature_loose,
                query_used = excluded.query_used,
                results_json = excluded.results_json,
                stats_json = excluded.stats_json,
                confidence = excluded.confidence,
                fetched_at = excluded.fetched_at,
                expires_at = excluded.expires_at",
            params![
                signature_strict,
                signature_loose,
                query_used,
                results_json,
                stats_json,
                confidence_str,
                now.to_rfc3339(),
                expires_at.to_rfc3339(),
            ],
        )?;

        fetch_entry_by_signature(&conn, "signature_strict", signature_strict, Utc::now())?
            .ok_or_else(|| anyhow::anyhow!("cache entry vanished immediately after upsert"))
    }

    pub async fn record_search_history(
        &self,
        user: &str,
        domain: &str,
        lot_url: Option<&str>,
        raw_title: &str,
        normalized: &NormalizedProduct,
        source: CacheSource,
        cache_entry_id: Option<i64>,
        auction_price: Option<f64>,
        currency: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let normalized_json = serde_json::to_string(normalized)?;
        let source_str = serde_json::to_string(&source)?;

        conn.execute(
            "INSERT INTO search_history
                (user, created_at, domain, lot_url, raw_title, normalized_json,
                 signature_strict, signature_loose, source, cache_entry_id, auction_price, currency)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                user,
                now.to_rfc3339(),
                domain,
                lot_url,
                raw_title,
                normalized_json,
                normalized.signatures.strict,
                normalized.signatures.loose,
                source_str,
                cache_entry_id,
                auction_price,
                currency,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_search_history(&self, user: &str, query: &HistoryQuery) -> Result<Vec<SearchHistoryRow>> {
        let conn = self.conn.lock().await;
        let page = query.page.max(1);
        let page_size = query.page_size.clamp(1, 100);
        let offset = (page - 1) * page_size;

        let mut sql = String::from(
            "SELECT id, user, created_at, domain, lot_url, raw_title, normalized_json,
                    signature_strict, signature_loose, source, cache_entry_id, auction_price, currency
             FROM search_history WHERE user = ?1",
        );
        if query.domain.is_some() {
            sql.push_str(" AND domain = ?2");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?3 OFFSET ?4");

        let mut stmt = conn.prepare(&sql)?;
        let rows = if let Some(domain) = &query.domain {
            stmt.query_map(
                params![user, domain, page_size as i64, offset as i64],
                map_history_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            stmt.query_map(params![user, page_size as i64, offset as i64], map_history_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut rows = rows;
        if let Some(source) = &query.source {
            let wanted = serde_json::to_string(source)?;
            rows.retain(|r| serde_json::to_string(&r.source).map(|s| s == wanted).unwrap_or(false));
        }
        if let Some(start) = query.start_date {
            rows.retain(|r| r.created_at >= start);
        }
        if let Some(end) = query.end_date {
            rows.retain(|r| r.created_at <= end);
        }
        Ok(rows)
    }

    /// Total rows for a user (optionally narrowed by domain), ignoring the
    /// in-memory source/date-range filters `get_search_history` applies
    /// after pagination — an exact count across those would mean scanning
    /// every matching row regardless of page size, which defeats the point
    /// of paginating. Good enough for a UI total; see DESIGN.md.
    pub async fn count_search_history(&self, user: &str, domain: Option<&str>) -> Result<i64> {
        let conn = self.conn.lock().await;
        if let Some(domain) = domain {
            conn.query_row(
                "SELECT COUNT(*) FROM search_history WHERE user = ?1 AND domain = ?2",
                params![user, domain],
                |r| r.get(0),
            )
            .map_err(Into::into)
        } else {
            conn.query_row(
                "SELECT COUNT(*) FROM search_history WHERE user = ?1",
                params![user],
                |r| r.get(0),
            )
            .map_err(Into::into)
        }
    }

    /// Sweep rows with `expires_at < now`. Returns rows removed.
    pub async fn cleanup_expired_cache(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let removed = conn.execute("DELETE FROM compare_cache WHERE expires_at < ?1", params![now])?;
        Ok(removed)
    }
}

fn fetch_entry_by_signature(
    conn: &Connection,
    column: &str,
    value: &str,
    now: DateTime<Utc>,
) -> Result<Option<CompareCacheEntry>> {
    let sql = format!(
        "SELECT id, signature_strict, signature_loose, query_used, results_json, stats_json, confidence, fetched_at, expires_at
         FROM compare_cache WHERE {column} = ?1 AND expires_at > ?2"
    );
    conn.query_row(&sql, params![value, now.to_rfc3339()], map_cache_row)
        .optional()
        .map_err(Into::into)
}

fn fetch_loose_entry(
    conn: &Connection,
    signature_loose: &str,
    now: DateTime<Utc>,
    freshness_cutoff: DateTime<Utc>,
) -> Result<Option<CompareCacheEntry>> {
    conn.query_row(
        "SELECT id, signature_strict, signature_loose, query_used, results_json, stats_json, confidence, fetched_at, expires_at
         FROM compare_cache
         WHERE signature_loose = ?1 AND expires_at > ?2 AND fetched_at > ?3
         ORDER BY fetched_at DESC LIMIT 1",
        params![signature_loose, now.to_rfc3339(), freshness_cutoff.to_rfc3339()],
        map_cache_row,
    )
    .optional()
    .map_err(Into::into)
}

fn map_cache_row(row: &rusqlite::Row) -> rusqlite::Result<CompareCacheEntry> {
    let results_json: String = row.get(4)?;
    let stats_json: String = row.get(5)?;
    let confidence_json: String = row.get(6)?;
    let fetched_at: String = row.get(7)?;
    let expires_at: String = row.get(8)?;

    Ok(CompareCacheEntry {
        id: row.get(0)?,
        signature_strict: row.get(1)?,
        signature_loose: row.get(2)?,
        query_used: row.get(3)?,
        results: serde_json::from_str(&results_json).unwrap_or_default(),
        stats: serde_json::from_str(&stats_json).unwrap_or(Stats {
            min: 0.0,
            median: 0.0,
            max: 0.0,
            average: 0.0,
            count: 0,
        }),
        confidence: serde_json::from_str(&confidence_json).unwrap_or(Confidence::Low),
        fetched_at: DateTime::parse_from_rfc3339(&fetched_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        expires_at: DateTime::parse_from_rfc3339(&expires_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn map_history_row(row: &rusqlite::Row) -> rusqlite::Result<SearchHistoryRow> {
    let created_at: String = row.get(2)?;
    let normalized_json: String = row.get(6)?;
    let source_json: String = row.get(9)?;

    Ok(SearchHistoryRow {
        id: row.get(0)?,
        user: row.get(1)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        domain: row.get(3)?,
        lot_url: row.get(4)?,
        raw_title: row.get(5)?,
        normalized: serde_json::from_str(&normalized_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?,
        signature_strict: row.get(7)?,
        signature_loose: row.get(8)?,
        source: serde_json::from_str(&source_json).unwrap_or(CacheSource::FreshFetch),
        cache_entry_id: row.get(10)?,
        auction_price: row.get(11)?,
        currency: row.get(12)?,
    })
}
