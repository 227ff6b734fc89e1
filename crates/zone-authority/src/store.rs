//! Read access to the zone and record tables.
//!
//! The query plane never writes records: the management API owns the
//! schema, and this module reads only the columns the resolver needs.
//! The one exception is flipping a zone active once its delegation
//! checks out, which the activation checker does through the same
//! interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use thiserror::Error;

/// An administrative slice of the namespace: one registrable domain,
/// owned by one tenant.
#[derive(Debug, Clone, Eq, PartialEq, sqlx::FromRow)]
pub struct Zone {
    pub id: String,
    pub user_id: String,
    /// The registrable domain: lowercase ASCII, no trailing dot.
    pub zone_name: String,
    /// Only active zones are queryable.  Zones are created inactive
    /// and flipped by the activation checker.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single record row.  `zone_name` is denormalised onto the record
/// so a zone's records can be fetched without a join.
#[derive(Debug, Clone, Eq, PartialEq, sqlx::FromRow)]
pub struct ZoneRecord {
    pub id: String,
    pub user_id: String,
    pub zone_id: String,
    pub zone_name: String,
    /// The fully qualified owner name: lowercase ASCII, no trailing
    /// dot, always a descendant of (or equal to) `zone_name`.
    pub name: String,
    /// The record type as a string ("A", "CNAME", ...).
    #[sqlx(rename = "type")]
    pub record_type: String,
    /// Textual RDATA: an IPv4 literal for A, a target name for CNAME.
    pub content: String,
    pub ttl: i32,
    /// Relative share for weighted selection.  Zero means "no
    /// preference".
    pub weight: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// The store operations the query plane needs.  A trait so the cache,
/// filter, and checkers can be exercised against an in-memory double.
#[async_trait]
pub trait ZoneStore: Send + Sync {
    /// All records belonging to an active zone, in insertion order.
    async fn records_for_zone(&self, zone_name: &str) -> Result<Vec<ZoneRecord>, StoreError>;

    /// The names of every active zone, for filter builds.
    async fn active_zone_names(&self) -> Result<Vec<String>, StoreError>;

    /// Every zone still waiting on delegation.
    async fn inactive_zones(&self) -> Result<Vec<Zone>, StoreError>;

    /// Mark a zone active.
    async fn activate_zone(&self, zone_id: &str) -> Result<(), StoreError>;
}

/// The production store, backed by Postgres.
#[derive(Debug, Clone)]
pub struct PgZoneStore {
    pool: PgPool,
}

impl PgZoneStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ZoneStore for PgZoneStore {
    async fn records_for_zone(&self, zone_name: &str) -> Result<Vec<ZoneRecord>, StoreError> {
        let records = sqlx::query_as::<_, ZoneRecord>(
            r#"SELECT id, user_id, zone_id, zone_name, name, type, content, ttl, weight,
                      created_at, updated_at
               FROM dns_records
               WHERE zone_name = $1
               ORDER BY created_at"#,
        )
        .bind(zone_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn active_zone_names(&self) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT zone_name FROM zones WHERE is_active = TRUE",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(names)
    }

    async fn inactive_zones(&self) -> Result<Vec<Zone>, StoreError> {
        let zones = sqlx::query_as::<_, Zone>(
            r#"SELECT id, user_id, zone_name, is_active, created_at, updated_at
               FROM zones
               WHERE is_active = FALSE"#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(zones)
    }

    async fn activate_zone(&self, zone_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE zones SET is_active = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(zone_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
