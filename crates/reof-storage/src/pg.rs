use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reof_core::{NormalizedListing, Opportunity, ScanRun, ScanStatus};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{OpportunityStore, RefreshPolicy, StoreError, UpsertOutcome};

const OPPORTUNITY_COLUMNS: &str = r#"
    id, natural_key, title, price, area, price_per_area, rooms, bathrooms, parking_spaces,
    neighborhood, address, source_url, reference, score, source, city, state,
    potential_category, discovered_at
"#;

/// PostgreSQL-backed store. Key uniqueness is enforced by the `natural_key` unique index,
/// so concurrent scan workers can upsert without coordination.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(key: &str, column: &str, value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::InvalidRow {
        key: key.to_string(),
        detail: format!("{column} is negative ({value})"),
    })
}

fn opportunity_from_row(row: &PgRow) -> Result<Opportunity, StoreError> {
    let key: String = row.try_get("natural_key")?;
    let listing = NormalizedListing {
        title: row.try_get("title")?,
        price: row.try_get("price")?,
        area: row.try_get("area")?,
        price_per_area: row.try_get("price_per_area")?,
        rooms: to_u32(&key, "rooms", row.try_get("rooms")?)?,
        bathrooms: to_u32(&key, "bathrooms", row.try_get("bathrooms")?)?,
        parking_spaces: to_u32(&key, "parking_spaces", row.try_get("parking_spaces")?)?,
        neighborhood: row.try_get("neighborhood")?,
        address: row.try_get("address")?,
        source_url: row.try_get("source_url")?,
        reference: row.try_get("reference")?,
    };
    Ok(Opportunity {
        id: row.try_get("id")?,
        listing,
        score: to_u32(&key, "score", row.try_get("score")?)?,
        source: row.try_get("source")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        potential_category: row.try_get("potential_category")?,
        discovered_at: row.try_get::<DateTime<Utc>, _>("discovered_at")?,
    })
}

fn scan_run_from_row(row: &PgRow) -> Result<ScanRun, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let count = |column: &str| -> Result<usize, StoreError> {
        let value: i64 = row.try_get(column)?;
        usize::try_from(value).map_err(|_| StoreError::InvalidRow {
            key: id.to_string(),
            detail: format!("{column} is negative ({value})"),
        })
    };
    Ok(ScanRun {
        id,
        run_id: row.try_get("run_id")?,
        source: row.try_get("source")?,
        city: row.try_get("city")?,
        total_candidates: count("total_candidates")?,
        opportunities_found: count("opportunities_found")?,
        duration_seconds: row.try_get("duration_seconds")?,
        status: ScanStatus::from(row.try_get::<String, _>("status")?),
        timestamp: row.try_get("scanned_at")?,
    })
}

#[async_trait]
impl OpportunityStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn upsert(
        &self,
        opportunity: &Opportunity,
        policy: RefreshPolicy,
    ) -> Result<UpsertOutcome, StoreError> {
        let on_conflict = match policy {
            RefreshPolicy::SkipIfPresent => "DO NOTHING",
            RefreshPolicy::RefreshMutable => {
                r#"DO UPDATE SET
                    title = EXCLUDED.title,
                    price = EXCLUDED.price,
                    area = EXCLUDED.area,
                    price_per_area = EXCLUDED.price_per_area,
                    rooms = EXCLUDED.rooms,
                    bathrooms = EXCLUDED.bathrooms,
                    parking_spaces = EXCLUDED.parking_spaces,
                    neighborhood = EXCLUDED.neighborhood,
                    address = EXCLUDED.address,
                    source_url = EXCLUDED.source_url,
                    score = EXCLUDED.score,
                    potential_category = EXCLUDED.potential_category,
                    updated_at = NOW()"#
            }
        };
        let sql = format!(
            r#"
            INSERT INTO opportunities ({OPPORTUNITY_COLUMNS}, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, NOW())
            ON CONFLICT (natural_key) {on_conflict}
            RETURNING (xmax = 0) AS inserted
            "#
        );

        let listing = &opportunity.listing;
        let row = sqlx::query(&sql)
            .bind(opportunity.id)
            .bind(opportunity.natural_key().to_string())
            .bind(&listing.title)
            .bind(listing.price)
            .bind(listing.area)
            .bind(listing.price_per_area)
            .bind(to_i32(listing.rooms))
            .bind(to_i32(listing.bathrooms))
            .bind(to_i32(listing.parking_spaces))
            .bind(&listing.neighborhood)
            .bind(&listing.address)
            .bind(&listing.source_url)
            .bind(&listing.reference)
            .bind(to_i32(opportunity.score))
            .bind(&opportunity.source)
            .bind(&opportunity.city)
            .bind(&opportunity.state)
            .bind(&opportunity.potential_category)
            .bind(opportunity.discovered_at)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            None => UpsertOutcome::Skipped,
            Some(row) if row.try_get::<bool, _>("inserted")? => UpsertOutcome::Inserted,
            Some(_) => UpsertOutcome::Refreshed,
        })
    }

    async fn list_all(&self) -> Result<Vec<Opportunity>, StoreError> {
        let sql = format!(
            "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities ORDER BY score DESC, discovered_at ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(opportunity_from_row).collect()
    }

    async fn list_by_city(&self, city: &str) -> Result<Vec<Opportunity>, StoreError> {
        let sql = format!(
            r#"
            SELECT {OPPORTUNITY_COLUMNS}
              FROM opportunities
             WHERE LOWER(city) = LOWER($1)
             ORDER BY score DESC, discovered_at ASC
            "#
        );
        let rows = sqlx::query(&sql).bind(city).fetch_all(&self.pool).await?;
        rows.iter().map(opportunity_from_row).collect()
    }

    async fn append_scan_run(&self, run: &ScanRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scan_runs
                (id, run_id, source, city, total_candidates, opportunities_found,
                 duration_seconds, status, scanned_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.id)
        .bind(run.run_id)
        .bind(&run.source)
        .bind(&run.city)
        .bind(i64::try_from(run.total_candidates).unwrap_or(i64::MAX))
        .bind(i64::try_from(run.opportunities_found).unwrap_or(i64::MAX))
        .bind(run.duration_seconds)
        .bind(run.status.to_string())
        .bind(run.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_scan_runs(&self, limit: Option<usize>) -> Result<Vec<ScanRun>, StoreError> {
        let limit = limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, source, city, total_candidates, opportunities_found,
                   duration_seconds, status, scanned_at
              FROM scan_runs
             ORDER BY scanned_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(scan_run_from_row).collect()
    }
}
