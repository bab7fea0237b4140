use crate::error::CoreError;
use crate::store::{Record, Table};
use courier_api::normalize_relay_url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayHealthRecord {
    pub relay_url: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success_at: Option<u64>,
    pub last_failure_at: Option<u64>,
    pub score: i64,
}

impl RelayHealthRecord {
    pub fn new(relay_url: &str) -> Self {
        Self {
            relay_url: normalize_relay_url(relay_url),
            success_count: 0,
            failure_count: 0,
            last_success_at: None,
            last_failure_at: None,
            score: 0,
        }
    }

    pub fn record(&mut self, ok: bool, now: u64) {
        if ok {
            self.success_count += 1;
            self.last_success_at = Some(now);
        } else {
            self.failure_count += 1;
            self.last_failure_at = Some(now);
        }
        self.score = health_score(self);
    }

    fn last_attempt_failed(&self) -> bool {
        match (self.last_success_at, self.last_failure_at) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(success), Some(failure)) => failure > success,
        }
    }
}

impl Record for RelayHealthRecord {
    fn key(&self) -> String {
        self.relay_url.clone()
    }
}

/// `2 * success - failure`, minus one more when the latest attempt failed.
pub fn health_score(record: &RelayHealthRecord) -> i64 {
    let base = 2 * record.success_count as i64 - record.failure_count as i64;
    if record.last_attempt_failed() {
        base - 1
    } else {
        base
    }
}

/// Orders relay URLs by score, highest first. Unknown relays score zero and
/// ties keep their input order.
pub fn rank(urls: &[String], records: &[RelayHealthRecord]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for url in urls {
        let normalized = normalize_relay_url(url);
        if !normalized.is_empty() && !seen.contains(&normalized) {
            seen.push(normalized);
        }
    }
    let mut scored: Vec<(i64, String)> = seen
        .into_iter()
        .map(|url| {
            let score = records
                .iter()
                .find(|r| r.relay_url == url)
                .map(health_score)
                .unwrap_or(0);
            (score, url)
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, url)| url).collect()
}

/// Preferred relays first, topped up from `vetted` until `min` targets exist.
/// The second element lists the relays that were added from `vetted`.
pub fn select_publish_relays(
    preferred: &[String],
    vetted: &[String],
    min: usize,
) -> (Vec<String>, Vec<String>) {
    let mut targets: Vec<String> = Vec::new();
    for url in preferred {
        let normalized = normalize_relay_url(url);
        if !normalized.is_empty() && !targets.contains(&normalized) {
            targets.push(normalized);
        }
    }
    let mut appended = Vec::new();
    for url in vetted {
        if targets.len() >= min {
            break;
        }
        let normalized = normalize_relay_url(url);
        if !normalized.is_empty() && !targets.contains(&normalized) {
            targets.push(normalized.clone());
            appended.push(normalized);
        }
    }
    (targets, appended)
}

#[derive(Clone)]
pub struct RelayHealthRanker {
    table: Arc<dyn Table<RelayHealthRecord>>,
}

impl RelayHealthRanker {
    pub fn new(table: Arc<dyn Table<RelayHealthRecord>>) -> Self {
        Self { table }
    }

    pub async fn record_result(
        &self,
        url: &str,
        ok: bool,
        now: u64,
    ) -> Result<RelayHealthRecord, CoreError> {
        let key = normalize_relay_url(url);
        let mut record = self
            .table
            .get(&key)
            .await?
            .unwrap_or_else(|| RelayHealthRecord::new(&key));
        record.record(ok, now);
        self.table.put(record.clone()).await?;
        Ok(record)
    }

    pub async fn rank(&self, urls: &[String]) -> Result<Vec<String>, CoreError> {
        let keys: Vec<String> = urls.iter().map(|u| normalize_relay_url(u)).collect();
        let records: Vec<RelayHealthRecord> = self
            .table
            .bulk_get(&keys)
            .await?
            .into_iter()
            .flatten()
            .collect();
        Ok(rank(urls, &records))
    }

    pub async fn records(&self) -> Result<Vec<RelayHealthRecord>, CoreError> {
        self.table.scan().await
    }
}
