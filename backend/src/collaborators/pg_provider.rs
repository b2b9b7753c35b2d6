//! Postgres-backed data provider
//!
//! Reads recent sales from the `comparable_sales` table
//! (see `migrations/0001_comparable_sales.sql`).

use crate::collaborators::{CollaboratorError, DataProvider, SubjectQuery};
use crate::valuation::normalize::{RawRecord, RecordRole};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::{debug, info};

const DEFAULT_MAX_RESULTS: i64 = 50;
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Database row from comparable_sales table
#[derive(Debug, sqlx::FromRow)]
pub struct ComparableRow {
    pub address: String,
    pub postcode: Option<String>,
    pub sqft: Option<i32>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<Decimal>,
    pub lot_size: Option<Decimal>,
    pub year_built: Option<i32>,
    pub condition: Option<String>,
    pub sale_price: Option<Decimal>,
    pub sale_date: NaiveDate,
    pub latitude: Option<Decimal>,
    pub longitude: Option<Decimal>,
    pub data_source: Option<String>,
    pub collected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct PgDataProvider {
    pool: PgPool,
    source_id: String,
}

impl PgDataProvider {
    pub fn new(pool: PgPool, source_id: impl Into<String>) -> Self {
        PgDataProvider {
            pool,
            source_id: source_id.into(),
        }
    }
}

fn classify(err: sqlx::Error) -> CollaboratorError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
            CollaboratorError::Recoverable(err.to_string())
        }
        other => CollaboratorError::Terminal(other.to_string()),
    }
}

#[async_trait]
impl DataProvider for PgDataProvider {
    async fn fetch(&self, query: &SubjectQuery) -> Result<Vec<RawRecord>, CollaboratorError> {
        let limit = query.max_results.map(|m| m as i64).unwrap_or(DEFAULT_MAX_RESULTS);

        let rows = sqlx::query_as::<_, ComparableRow>(
            r#"
            SELECT address, postcode, sqft, bedrooms, bathrooms, lot_size, year_built, condition,
                   sale_price, sale_date, latitude, longitude, data_source, collected_at
            FROM comparable_sales
            WHERE ($1::TEXT IS NULL OR postcode = $1)
              AND lower(address) <> lower($2)
            ORDER BY sale_date DESC
            LIMIT $3
            "#,
        )
        .bind(&query.postcode)
        .bind(&query.address)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        debug!("comparable_sales returned {} rows for {}", rows.len(), query.address);

        let origin = query.latitude.zip(query.longitude);
        let mut records = vec![query.subject_record("request")];

        for row in rows {
            let distance = match (origin, decimal_f64(row.latitude), decimal_f64(row.longitude)) {
                (Some((lat, lon)), Some(row_lat), Some(row_lon)) => {
                    Some(haversine_km(lat, lon, row_lat, row_lon))
                }
                _ => None,
            };

            if let (Some(radius), Some(d)) = (query.radius_km, distance) {
                if d > radius {
                    continue;
                }
            }

            let source = row.data_source.clone().unwrap_or_else(|| self.source_id.clone());
            let collected_at = row.collected_at;
            let mut record = RawRecord::new(RecordRole::Comparable, source, row_attributes(row, distance));
            record.collected_at = collected_at;
            records.push(record);
        }

        info!("Loaded {} comparables from Postgres", records.len() - 1);
        Ok(records)
    }
}

fn row_attributes(row: ComparableRow, distance_km: Option<f64>) -> Map<String, Value> {
    let mut attrs = Map::new();
    attrs.insert("address".to_string(), Value::from(row.address));
    attrs.insert("sale_date".to_string(), Value::from(row.sale_date.format("%Y-%m-%d").to_string()));

    let optional = [
        ("postcode", row.postcode.map(Value::from)),
        ("sqft", row.sqft.map(Value::from)),
        ("bedrooms", row.bedrooms.map(Value::from)),
        ("bathrooms", decimal_f64(row.bathrooms).map(Value::from)),
        ("lot_size", decimal_f64(row.lot_size).map(Value::from)),
        ("year_built", row.year_built.map(Value::from)),
        ("condition", row.condition.map(Value::from)),
        ("sale_price", decimal_f64(row.sale_price).map(Value::from)),
        ("distance_km", distance_km.map(Value::from)),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            attrs.insert(key.to_string(), value);
        }
    }
    attrs
}

fn decimal_f64(value: Option<Decimal>) -> Option<f64> {
    value.and_then(|d| d.to_f64())
}

/// Great-circle distance between two lat/lon points
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}
