//! Token Metrics Engine: a read-mostly aggregation layer over the
//! observation store, computing token-economics rollups and serving them
//! through a small TTL cache.
//!
//! Grounded on `budget/mod.rs`'s aggregation-query style (`COALESCE(SUM(...))`
//! rollups over a sqlx pool, daily/monthly bucketing) generalized here to
//! the token-savings math; the cache itself follows `cache/session_state.rs`'s
//! warmth/TTL check pattern.

use crate::broadcast::{Broadcaster, LiveEvent, TokenSummarySnapshot};
use crate::config::MetricsConfig;
use crate::model::Observation;
use crate::store::ObservationStore;
use chrono::{DateTime, Datelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `ceil(S/4)` heuristic, computed directly from the already-decoded
/// observation fields (the "parse the raw JSON array" fallback named in
/// the char-length rule only matters for implementations that keep the
/// array fields encoded; ours decodes them at the store boundary).
pub fn read_tokens(obs: &Observation) -> i64 {
    let concat_len = |items: &[String]| -> usize { items.iter().map(|s| s.chars().count()).sum() };
    let char_len = obs.title.chars().count()
        + obs.subtitle.chars().count()
        + obs.narrative.chars().count()
        + concat_len(&obs.facts)
        + concat_len(&obs.concepts)
        + concat_len(&obs.files_read)
        + concat_len(&obs.files_modified);
    ((char_len as i64) + 3) / 4
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TokenSummary {
    pub total_observations: i64,
    pub total_read_tokens: i64,
    pub total_discovery_tokens: i64,
    pub savings: i64,
    pub savings_percent: i64,
    pub efficiency_gain: f64,
    pub avg_read_tokens_per_obs: i64,
    pub avg_discovery_tokens_per_obs: i64,
}

impl TokenSummary {
    fn from_observations(observations: &[Observation]) -> Self {
        let total_observations = observations.len() as i64;
        let total_read_tokens: i64 = observations.iter().map(read_tokens).sum();
        let total_discovery_tokens: i64 = observations.iter().map(|o| o.discovery_tokens).sum();
        let savings = total_discovery_tokens - total_read_tokens;
        let savings_percent = if total_discovery_tokens == 0 {
            0
        } else {
            (savings as f64 / total_discovery_tokens as f64 * 100.0).round() as i64
        };
        let efficiency_gain = if total_read_tokens == 0 {
            0.0
        } else {
            round_to(total_discovery_tokens as f64 / total_read_tokens as f64 * 10.0, 0) / 10.0
        };
        let avg_read_tokens_per_obs = if total_observations == 0 {
            0
        } else {
            (total_read_tokens as f64 / total_observations as f64).round() as i64
        };
        let avg_discovery_tokens_per_obs = if total_observations == 0 {
            0
        } else {
            (total_discovery_tokens as f64 / total_observations as f64).round() as i64
        };
        Self {
            total_observations,
            total_read_tokens,
            total_discovery_tokens,
            savings,
            savings_percent,
            efficiency_gain,
            avg_read_tokens_per_obs,
            avg_discovery_tokens_per_obs,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ByProjectRow {
    pub project: String,
    pub total_observations: i64,
    pub total_read_tokens: i64,
    pub total_discovery_tokens: i64,
    pub savings: i64,
    pub savings_percent: i64,
    pub efficiency_gain: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ByProjectResult {
    pub rows: Vec<ByProjectRow>,
    pub total_projects: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ByTypeRow {
    #[serde(rename = "type")]
    pub r#type: String,
    pub total_observations: i64,
    pub total_read_tokens: i64,
    pub total_discovery_tokens: i64,
    pub savings: i64,
    pub savings_percent: i64,
    pub efficiency_gain: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hour,
    Day,
    Week,
}

impl Granularity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hour" => Some(Granularity::Hour),
            "day" => Some(Granularity::Day),
            "week" => Some(Granularity::Week),
            _ => None,
        }
    }

    fn bucket_label(&self, epoch_ms: i64) -> String {
        let dt: DateTime<Utc> = DateTime::from_timestamp_millis(epoch_ms).unwrap_or_default();
        match self {
            Granularity::Hour => dt.format("%Y-%m-%dT%H:00:00Z").to_string(),
            Granularity::Day => dt.format("%Y-%m-%d").to_string(),
            Granularity::Week => {
                let iso = dt.iso_week();
                format!("{}-W{:02}", iso.year(), iso.week())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeSeriesRow {
    pub bucket: String,
    pub observations: i64,
    pub read_tokens: i64,
    pub discovery_tokens: i64,
    pub cumulative_read_tokens: i64,
    pub cumulative_discovery_tokens: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompressionByType {
    #[serde(rename = "type")]
    pub r#type: String,
    pub avg_compression_ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompressionResult {
    pub avg_compression_ratio: f64,
    pub by_type: Vec<CompressionByType>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct EndlessModeProjection {
    pub total_tokens_without: i64,
    pub total_tokens_endless: i64,
    pub tokens_saved: i64,
    pub percent_saved: f64,
    pub efficiency_gain: f64,
}

fn compression_ratio(observations: &[Observation]) -> f64 {
    let total_original: i64 = observations.iter().map(|o| o.discovery_tokens * 2).sum();
    let total_compressed: i64 = observations.iter().map(read_tokens).sum();
    if total_original == 0 {
        return 0.0;
    }
    round_to(
        (1.0 - total_compressed as f64 / total_original as f64) * 100.0,
        0,
    ) / 100.0
}

/// `^(\d+)(h|d|w)$` relative form, else an ISO timestamp, else no bound.
pub fn parse_since(since: &str, now: DateTime<Utc>) -> Option<i64> {
    if let Some(captures) = parse_relative(since) {
        let (amount, unit) = captures;
        let delta = match unit {
            'h' => chrono::Duration::hours(amount),
            'd' => chrono::Duration::days(amount),
            'w' => chrono::Duration::weeks(amount),
            _ => return None,
        };
        return Some((now - delta).timestamp_millis());
    }
    DateTime::parse_from_rfc3339(since)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

fn parse_relative(s: &str) -> Option<(i64, char)> {
    let unit = s.chars().last()?;
    if !matches!(unit, 'h' | 'd' | 'w') {
        return None;
    }
    let digits = &s[..s.len() - 1];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<i64>().ok().map(|n| (n, unit))
}

struct CacheEntry {
    inserted_at: Instant,
    ttl: Duration,
    value: serde_json::Value,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.inserted_at.elapsed() < self.ttl
    }
}

struct MetricsCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MetricsCache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.lock();
        entries.get(key).filter(|e| e.is_fresh()).map(|e| e.value.clone())
    }

    fn put(&self, key: String, ttl: Duration, value: serde_json::Value) {
        self.entries.lock().insert(
            key,
            CacheEntry {
                inserted_at: Instant::now(),
                ttl,
                value,
            },
        );
    }

    fn invalidate(&self, project: Option<&str>) {
        let mut entries = self.entries.lock();
        match project {
            Some(p) => entries.retain(|k, _| !k.contains(&format!(":{}:", p))),
            None => entries.retain(|k, _| !k.starts_with("summary:")),
        }
    }
}

pub struct MetricsEngine {
    store: Arc<dyn ObservationStore>,
    cache: MetricsCache,
    broadcaster: Broadcaster,
    last_push_ms: AtomicI64,
    config: MetricsConfig,
}

impl MetricsEngine {
    pub fn new(store: Arc<dyn ObservationStore>, broadcaster: Broadcaster, config: MetricsConfig) -> Self {
        Self {
            store,
            cache: MetricsCache::new(),
            broadcaster,
            last_push_ms: AtomicI64::new(0),
            config,
        }
    }

    pub fn invalidate_cache(&self, project: Option<&str>) {
        self.cache.invalidate(project);
    }

    async fn observations(&self, project: Option<&str>, since: Option<&str>) -> Vec<Observation> {
        let since_ms = since.and_then(|s| parse_since(s, Utc::now()));
        self.store
            .observations_for_metrics(project, since_ms)
            .await
            .unwrap_or_default()
    }

    pub async fn summary(&self, project: Option<&str>, since: Option<&str>) -> TokenSummary {
        let key = format!("summary:{}:{}", project.unwrap_or("*"), since.unwrap_or(""));
        if let Some(cached) = self.cache.get(&key) {
            if let Ok(summary) = serde_json::from_value(cached) {
                return summary;
            }
        }
        let observations = self.observations(project, since).await;
        let summary = TokenSummary::from_observations(&observations);
        if let Ok(value) = serde_json::to_value(&summary) {
            self.cache.put(key, self.config.cache_ttl, value);
        }
        summary
    }

    /// Fast path used by the throttled live push: always fresh, no cache
    /// round-trip, same math as `summary`.
    pub async fn quick_summary(&self, project: Option<&str>, since: Option<&str>) -> TokenSummary {
        let observations = self.observations(project, since).await;
        TokenSummary::from_observations(&observations)
    }

    pub async fn by_project(&self, limit: i64, since: Option<&str>) -> ByProjectResult {
        let key = format!("by_project:*:{}:{}", since.unwrap_or(""), limit);
        if let Some(cached) = self.cache.get(&key) {
            if let Ok(result) = serde_json::from_value(cached) {
                return result;
            }
        }
        let observations = self.observations(None, since).await;
        let mut by_project: HashMap<String, Vec<&Observation>> = HashMap::new();
        for obs in &observations {
            by_project.entry(obs.project.clone()).or_default().push(obs);
        }
        let total_projects = by_project.len() as i64;
        let mut rows: Vec<ByProjectRow> = by_project
            .into_iter()
            .map(|(project, obs)| {
                let owned: Vec<Observation> = obs.into_iter().cloned().collect();
                let summary = TokenSummary::from_observations(&owned);
                ByProjectRow {
                    project,
                    total_observations: summary.total_observations,
                    total_read_tokens: summary.total_read_tokens,
                    total_discovery_tokens: summary.total_discovery_tokens,
                    savings: summary.savings,
                    savings_percent: summary.savings_percent,
                    efficiency_gain: summary.efficiency_gain,
                }
            })
            .collect();
        rows.sort_by(|a, b| b.total_discovery_tokens.cmp(&a.total_discovery_tokens));
        rows.truncate(limit.max(0) as usize);
        let result = ByProjectResult { rows, total_projects };
        if let Ok(value) = serde_json::to_value(&result) {
            self.cache.put(key, self.config.cache_ttl, value);
        }
        result
    }

    pub async fn by_type(&self, project: Option<&str>, since: Option<&str>) -> Vec<ByTypeRow> {
        let key = format!("by_type:{}:{}", project.unwrap_or("*"), since.unwrap_or(""));
        if let Some(cached) = self.cache.get(&key) {
            if let Ok(rows) = serde_json::from_value(cached) {
                return rows;
            }
        }
        let observations = self.observations(project, since).await;
        let mut by_type: HashMap<String, Vec<Observation>> = HashMap::new();
        for obs in observations {
            by_type.entry(obs.r#type.clone()).or_default().push(obs);
        }
        let mut rows: Vec<ByTypeRow> = by_type
            .into_iter()
            .map(|(r#type, obs)| {
                let summary = TokenSummary::from_observations(&obs);
                ByTypeRow {
                    r#type,
                    total_observations: summary.total_observations,
                    total_read_tokens: summary.total_read_tokens,
                    total_discovery_tokens: summary.total_discovery_tokens,
                    savings: summary.savings,
                    savings_percent: summary.savings_percent,
                    efficiency_gain: summary.efficiency_gain,
                }
            })
            .collect();
        rows.sort_by(|a, b| b.total_discovery_tokens.cmp(&a.total_discovery_tokens));
        if let Ok(value) = serde_json::to_value(&rows) {
            self.cache.put(key, self.config.cache_ttl, value);
        }
        rows
    }

    pub async fn time_series(
        &self,
        project: Option<&str>,
        since: Option<&str>,
        granularity: Granularity,
    ) -> Vec<TimeSeriesRow> {
        let observations = self.observations(project, since).await;
        let mut buckets: Vec<(String, Vec<&Observation>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for obs in &observations {
            let label = granularity.bucket_label(obs.created_at_epoch);
            match index.get(&label) {
                Some(&i) => buckets[i].1.push(obs),
                None => {
                    index.insert(label.clone(), buckets.len());
                    buckets.push((label, vec![obs]));
                }
            }
        }
        buckets.sort_by(|a, b| a.0.cmp(&b.0));

        let mut cum_read = 0i64;
        let mut cum_discovery = 0i64;
        buckets
            .into_iter()
            .map(|(bucket, obs)| {
                let read: i64 = obs.iter().map(|o| read_tokens(o)).sum();
                let discovery: i64 = obs.iter().map(|o| o.discovery_tokens).sum();
                cum_read += read;
                cum_discovery += discovery;
                TimeSeriesRow {
                    bucket,
                    observations: obs.len() as i64,
                    read_tokens: read,
                    discovery_tokens: discovery,
                    cumulative_read_tokens: cum_read,
                    cumulative_discovery_tokens: cum_discovery,
                }
            })
            .collect()
    }

    pub async fn compression(&self, project: Option<&str>, since: Option<&str>) -> CompressionResult {
        let observations = self.observations(project, since).await;
        let avg_compression_ratio = compression_ratio(&observations);

        let mut by_type_obs: HashMap<String, Vec<Observation>> = HashMap::new();
        for obs in observations {
            by_type_obs.entry(obs.r#type.clone()).or_default().push(obs);
        }
        let mut by_type: Vec<CompressionByType> = by_type_obs
            .into_iter()
            .map(|(r#type, obs)| CompressionByType {
                avg_compression_ratio: compression_ratio(&obs),
                r#type,
            })
            .collect();
        by_type.sort_by(|a, b| a.r#type.cmp(&b.r#type));

        CompressionResult {
            avg_compression_ratio,
            by_type,
        }
    }

    pub async fn projection(&self, project: &str, observation_count: i64) -> EndlessModeProjection {
        let key = format!("projection:{}:{}", project, observation_count);
        if let Some(cached) = self.cache.get(&key) {
            if let Ok(projection) = serde_json::from_value(cached) {
                return projection;
            }
        }
        let recent = self
            .store
            .recent_observations(project, observation_count)
            .await
            .unwrap_or_default();

        let (mut d_w, mut ctx_w, mut c_w) = (0i64, 0i64, 0i64);
        for obs in &recent {
            d_w += obs.discovery_tokens;
            ctx_w += obs.discovery_tokens * 2;
            c_w += ctx_w;
        }
        let (mut d_e, mut ctx_e, mut c_e) = (0i64, 0i64, 0i64);
        for obs in &recent {
            d_e += obs.discovery_tokens;
            ctx_e += read_tokens(obs);
            c_e += ctx_e;
        }

        let total_without = d_w + c_w;
        let total_endless = d_e + c_e;
        let tokens_saved = total_without - total_endless;
        let percent_saved = if total_without == 0 {
            0.0
        } else {
            round_to(tokens_saved as f64 / total_without as f64 * 1000.0, 0) / 10.0
        };
        let efficiency_gain = if total_endless == 0 {
            0.0
        } else {
            round_to(total_without as f64 / total_endless as f64 * 10.0, 0) / 10.0
        };

        let projection = EndlessModeProjection {
            total_tokens_without: total_without,
            total_tokens_endless: total_endless,
            tokens_saved,
            percent_saved,
            efficiency_gain,
        };
        if let Ok(value) = serde_json::to_value(&projection) {
            self.cache.put(key, self.config.projection_cache_ttl, value);
        }
        projection
    }

    /// Computes the quick summary and emits `token_update`, but only if at
    /// least 1s has elapsed since the last emission from this engine.
    pub async fn broadcast_token_update(&self, project: Option<&str>) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let last = self.last_push_ms.load(Ordering::Relaxed);
        if now_ms - last < self.config.live_push_interval.as_millis() as i64 {
            return;
        }
        if self
            .last_push_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let summary = self.quick_summary(project, None).await;
        self.broadcaster.publish(LiveEvent::TokenUpdate {
            tokens: TokenSummarySnapshot {
                total_observations: summary.total_observations,
                total_read_tokens: summary.total_read_tokens,
                total_discovery_tokens: summary.total_discovery_tokens,
                savings: summary.savings,
                savings_percent: summary.savings_percent,
                efficiency_gain: summary.efficiency_gain,
                avg_read_tokens_per_obs: summary.avg_read_tokens_per_obs,
                avg_discovery_tokens_per_obs: summary.avg_discovery_tokens_per_obs,
            },
            timestamp: now_ms,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(title: &str, discovery_tokens: i64) -> Observation {
        Observation {
            id: 1,
            assistant_session_id: "a".to_string(),
            project: "proj".to_string(),
            r#type: "code".to_string(),
            title: title.to_string(),
            subtitle: String::new(),
            narrative: String::new(),
            text: String::new(),
            facts: vec![],
            concepts: vec![],
            files_read: vec![],
            files_modified: vec![],
            prompt_number: Some(1),
            created_at_epoch: 0,
            discovery_tokens,
        }
    }

    #[test]
    fn read_tokens_ceil_division() {
        assert_eq!(read_tokens(&obs("ok", 40)), 1);
    }

    #[test]
    fn scenario_1_compression_math() {
        let summary = TokenSummary::from_observations(&[obs("ok", 40)]);
        assert_eq!(summary.total_observations, 1);
        assert_eq!(summary.total_read_tokens, 1);
        assert_eq!(summary.total_discovery_tokens, 40);
        assert_eq!(summary.savings, 39);
        assert_eq!(summary.savings_percent, 98);
        assert_eq!(summary.efficiency_gain, 40.0);
    }

    #[test]
    fn parse_since_relative_and_iso() {
        let now = Utc::now();
        assert!(parse_since("2h", now).is_some());
        assert!(parse_since("3d", now).is_some());
        assert!(parse_since("1w", now).is_some());
        assert!(parse_since("garbage", now).is_none());
        assert!(parse_since(&now.to_rfc3339(), now).is_some());
    }

    #[test]
    fn empty_projection_is_all_zero() {
        let projection = EndlessModeProjection::default();
        assert_eq!(projection.total_tokens_without, 0);
        assert_eq!(projection.tokens_saved, 0);
    }

    #[test]
    fn savings_plus_read_equals_discovery() {
        let summary = TokenSummary::from_observations(&[obs("a longer title for variety", 100)]);
        assert_eq!(summary.savings + summary.total_read_tokens, summary.total_discovery_tokens);
    }
}
