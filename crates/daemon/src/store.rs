//! Postgres-backed advisory store.
//!
//! Minimal implementation of the [`DocumentStore`] port: advisories are
//! upserted by URL with the change time the feed advertised, which is
//! also what the freshness check compares against.

use async_trait::async_trait;
use scythe_csaf::{DocumentStore, StoreError};
use scythe_db::Database;
use sqlx::Row;
use time::OffsetDateTime;
use url::Url;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS advisories (\
     url TEXT PRIMARY KEY, \
     changed TIMESTAMPTZ, \
     sources_id BIGINT, \
     feeds_id BIGINT, \
     document JSONB NOT NULL, \
     downloaded TIMESTAMPTZ NOT NULL DEFAULT NOW())";

pub struct PgDocumentStore {
    db: Database,
}

impl PgDocumentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn ensure_schema(&self) -> Result<(), scythe_db::DbError> {
        self.db
            .run(
                |conn| Box::pin(async move { sqlx::query(SCHEMA).execute(conn).await.map(|_| ()) }),
                0,
            )
            .await
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn is_current(
        &self,
        url: &Url,
        changed: Option<OffsetDateTime>,
    ) -> Result<bool, StoreError> {
        const SQL: &str = "SELECT changed FROM advisories WHERE url = $1";
        let url = url.to_string();
        let row = self
            .db
            .run(
                move |conn| {
                    let url = url.clone();
                    Box::pin(async move {
                        sqlx::query(SQL).bind(url).fetch_optional(conn).await
                    })
                },
                0,
            )
            .await
            .map_err(|err| StoreError::Internal(err.to_string()))?;
        Ok(match row {
            None => false,
            Some(row) => match (row.get::<Option<OffsetDateTime>, _>("changed"), changed) {
                (Some(stored), Some(advertised)) => stored >= advertised,
                // Without change times on either side the stored copy wins.
                _ => true,
            },
        })
    }

    async fn store(
        &self,
        source_id: i64,
        feed_id: i64,
        url: &Url,
        document: &serde_json::Value,
    ) -> Result<(), StoreError> {
        const SQL: &str = "INSERT INTO advisories (url, changed, sources_id, feeds_id, document) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (url) DO UPDATE SET \
             changed = EXCLUDED.changed, \
             sources_id = EXCLUDED.sources_id, \
             feeds_id = EXCLUDED.feeds_id, \
             document = EXCLUDED.document, \
             downloaded = NOW()";
        let url = url.to_string();
        let changed = document
            .pointer("/document/tracking/current_release_date")
            .and_then(|v| v.as_str())
            .and_then(|s| {
                OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339).ok()
            });
        let document = sqlx::types::Json(document.clone());
        self.db
            .run(
                move |conn| {
                    let url = url.clone();
                    let document = document.clone();
                    Box::pin(async move {
                        sqlx::query(SQL)
                            .bind(url)
                            .bind(changed)
                            .bind(source_id)
                            .bind(feed_id)
                            .bind(document)
                            .execute(conn)
                            .await
                            .map(|_| ())
                    })
                },
                0,
            )
            .await
            .map_err(|err| StoreError::Internal(err.to_string()))
    }
}
