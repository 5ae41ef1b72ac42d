//! Read-only aggregate reports over the dbt warehouse schema.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::FromRow;

use crate::error::{Error, Result};

pub const DEFAULT_SEARCH_LIMIT: i64 = 100;
pub const DEFAULT_REPORT_LIMIT: i64 = 10;
pub const MAX_LIMIT: i64 = 1000;

/// Words never reported as products.
pub const STOPWORDS: &[&str] = &["and", "the", "for", "with", "http", "https", "t.me"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MessageSearchResult {
    pub message_id: i64,
    pub message_text: Option<String>,
    pub channel_id: i64,
    pub message_posted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductReportItem {
    pub product_name: String,
    pub mention_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ChannelActivityItem {
    pub post_date: String,
    pub post_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct DetectedObjectReportItem {
    pub object_class: String,
    pub detection_count: i64,
}

pub fn clamp_limit(limit: Option<i64>, default: i64) -> i64 {
    limit.unwrap_or(default).clamp(1, MAX_LIMIT)
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Case-insensitive substring search, newest first.
    async fn search_messages(&self, query: &str, limit: i64) -> Result<Vec<MessageSearchResult>>;

    async fn top_products(&self, limit: i64) -> Result<Vec<ProductReportItem>>;

    async fn channel_id_by_name(&self, channel_name: &str) -> Result<Option<i64>>;

    /// Daily post counts, oldest day first.
    async fn channel_activity(&self, channel_id: i64) -> Result<Vec<ChannelActivityItem>>;

    async fn top_detected_objects(&self, limit: i64) -> Result<Vec<DetectedObjectReportItem>>;

    async fn channel_activity_by_name(
        &self,
        channel_name: &str,
    ) -> Result<Vec<ChannelActivityItem>> {
        match self.channel_id_by_name(channel_name).await? {
            Some(id) => self.channel_activity(id).await,
            None => Err(Error::ChannelNotFound(channel_name.to_string())),
        }
    }
}

/// Counts terms across texts: lower-cased, split on whitespace, tokens of
/// three characters or fewer and stopwords dropped.
#[derive(Debug, Default)]
pub struct TermCounter {
    counts: HashMap<String, i64>,
}

impl TermCounter {
    pub fn add(&mut self, text: &str) {
        for token in text.to_lowercase().split_whitespace() {
            if token.chars().count() <= 3 || STOPWORDS.contains(&token) {
                continue;
            }
            *self.counts.entry(token.to_string()).or_insert(0) += 1;
        }
    }

    /// Most frequent first; ties broken alphabetically.
    pub fn top(self, limit: usize) -> Vec<ProductReportItem> {
        let mut ranked: Vec<ProductReportItem> = self
            .counts
            .into_iter()
            .map(|(product_name, mention_count)| ProductReportItem {
                product_name,
                mention_count,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.mention_count
                .cmp(&a.mention_count)
                .then_with(|| a.product_name.cmp(&b.product_name))
        });
        ranked.truncate(limit);
        ranked
    }
}

#[cfg(test)]
pub fn rank_terms<'a, I>(texts: I, limit: usize) -> Vec<ProductReportItem>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counter = TermCounter::default();
    for text in texts {
        counter.add(text);
    }
    counter.top(limit)
}

/// Reports backed by the warehouse tables in PostgreSQL.
pub struct PgReports {
    pool: PgPool,
    schema: String,
}

impl PgReports {
    /// `schema` must already be validated as a plain identifier.
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        PgReports {
            pool,
            schema: schema.into(),
        }
    }
}

#[async_trait]
impl ReportStore for PgReports {
    async fn search_messages(&self, query: &str, limit: i64) -> Result<Vec<MessageSearchResult>> {
        let sql = format!(
            "SELECT message_id, message_text, channel_id,
                    message_posted_at::timestamptz AS message_posted_at
             FROM {}.fct_messages
             WHERE message_text ILIKE $1
             ORDER BY message_posted_at DESC
             LIMIT $2",
            self.schema
        );
        let rows = sqlx::query_as::<_, MessageSearchResult>(&sql)
            .bind(format!("%{}%", query))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn top_products(&self, limit: i64) -> Result<Vec<ProductReportItem>> {
        let sql = format!(
            "SELECT message_text FROM {}.fct_messages WHERE message_text IS NOT NULL",
            self.schema
        );
        let mut counter = TermCounter::default();
        let mut texts = sqlx::query_scalar::<_, String>(&sql).fetch(&self.pool);
        while let Some(text) = texts.try_next().await? {
            counter.add(&text);
        }
        Ok(counter.top(limit as usize))
    }

    async fn channel_id_by_name(&self, channel_name: &str) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT channel_id FROM {}.dim_channels WHERE channel_name = $1 LIMIT 1",
            self.schema
        );
        let id = sqlx::query_scalar::<_, i64>(&sql)
            .bind(channel_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn channel_activity(&self, channel_id: i64) -> Result<Vec<ChannelActivityItem>> {
        let sql = format!(
            "SELECT date(message_posted_at)::text AS post_date,
                    COUNT(message_id) AS post_count
             FROM {}.fct_messages
             WHERE channel_id = $1
             GROUP BY 1
             ORDER BY 1",
            self.schema
        );
        let rows = sqlx::query_as::<_, ChannelActivityItem>(&sql)
            .bind(channel_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn top_detected_objects(&self, limit: i64) -> Result<Vec<DetectedObjectReportItem>> {
        let sql = format!(
            "SELECT detected_object_class AS object_class,
                    COUNT(detection_id) AS detection_count
             FROM {}.fct_image_detections
             GROUP BY 1
             ORDER BY 2 DESC, 1
             LIMIT $1",
            self.schema
        );
        let rows = sqlx::query_as::<_, DetectedObjectReportItem>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}
