//! Normalize functions - coerce raw attribute maps into typed records
//!
//! Raw records arrive from heterogeneous providers (CSV rows, JSON bodies,
//! database rows) as loosely typed maps. Everything here is a pure function:
//! the same input always yields the same records, and feeding the output back
//! in (via [`NormalizedRecords::to_raw`]) changes nothing.

use crate::valuation::error::{Result, Stage, ValuationError};
use crate::valuation::types::{
    ComparableSale, Condition, PropertyRecord, Provenance, SourceMetadata, SourceSummary,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

const MIN_YEAR_BUILT: i64 = 1600;
const MAX_YEAR_BUILT: i64 = 2100;

/// Whether a raw record describes the subject or a comparable sale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordRole {
    Subject,
    Comparable,
}

/// One loosely typed record as delivered by a data provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub role: RecordRole,
    pub source: String,
    #[serde(default)]
    pub collected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl RawRecord {
    pub fn new(role: RecordRole, source: impl Into<String>, attributes: Map<String, Value>) -> Self {
        RawRecord {
            role,
            source: source.into(),
            collected_at: None,
            attributes,
        }
    }
}

/// Normalizer output: subject, deduplicated comparables and provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecords {
    pub subject: PropertyRecord,
    pub subject_provenance: Provenance,
    pub comparables: Vec<ComparableSale>,
    pub source_metadata: SourceMetadata,
}

impl NormalizedRecords {
    /// Render the normalized set back into raw records with canonical keys
    pub fn to_raw(&self) -> Vec<RawRecord> {
        let mut raw = Vec::with_capacity(self.comparables.len() + 1);

        let mut attrs = Map::new();
        attrs.insert("address".to_string(), Value::from(self.subject.address.clone()));
        attrs.insert("sqft".to_string(), Value::from(self.subject.sqft));
        insert_common(
            &mut attrs,
            self.subject.bedrooms,
            self.subject.bathrooms,
            self.subject.lot_size,
            self.subject.year_built,
            self.subject.condition,
            &self.subject.amenities,
        );
        raw.push(RawRecord {
            role: RecordRole::Subject,
            source: self.subject_provenance.source.clone(),
            collected_at: Some(self.subject_provenance.collected_at),
            attributes: attrs,
        });

        for comp in &self.comparables {
            let mut attrs = Map::new();
            attrs.insert("address".to_string(), Value::from(comp.address.clone()));
            if let Some(sqft) = comp.sqft {
                attrs.insert("sqft".to_string(), Value::from(sqft));
            }
            insert_common(
                &mut attrs,
                comp.bedrooms,
                comp.bathrooms,
                comp.lot_size,
                comp.year_built,
                comp.condition,
                &comp.amenities,
            );
            if let Some(price) = comp.sale_price {
                attrs.insert("sale_price".to_string(), Value::from(price));
            }
            attrs.insert(
                "sale_date".to_string(),
                Value::from(comp.sale_date.format("%Y-%m-%d").to_string()),
            );
            if let Some(distance) = comp.distance_km {
                attrs.insert("distance_km".to_string(), Value::from(distance));
            }
            raw.push(RawRecord {
                role: RecordRole::Comparable,
                source: comp.provenance.source.clone(),
                collected_at: Some(comp.provenance.collected_at),
                attributes: attrs,
            });
        }

        raw
    }
}

fn insert_common(
    attrs: &mut Map<String, Value>,
    bedrooms: Option<u32>,
    bathrooms: Option<f64>,
    lot_size: Option<f64>,
    year_built: Option<i32>,
    condition: Option<Condition>,
    amenities: &BTreeSet<String>,
) {
    if let Some(v) = bedrooms {
        attrs.insert("bedrooms".to_string(), Value::from(v));
    }
    if let Some(v) = bathrooms {
        attrs.insert("bathrooms".to_string(), Value::from(v));
    }
    if let Some(v) = lot_size {
        attrs.insert("lot_size".to_string(), Value::from(v));
    }
    if let Some(v) = year_built {
        attrs.insert("year_built".to_string(), Value::from(v));
    }
    if let Some(v) = condition {
        attrs.insert("condition".to_string(), Value::from(v.to_string()));
    }
    if !amenities.is_empty() {
        attrs.insert(
            "amenities".to_string(),
            Value::Array(amenities.iter().cloned().map(Value::from).collect()),
        );
    }
}

/// Normalize raw records, stamping records without a collection time with now
pub fn normalize(raw: &[RawRecord]) -> Result<NormalizedRecords> {
    normalize_at(raw, Utc::now())
}

/// Normalize raw records into a subject, deduplicated comparables and metadata.
///
/// Fails with `MalformedInput` when no subject is present or the merged
/// subject lacks an address or a positive sqft. Invalid comparables are
/// dropped and counted. Duplicate comparables (same address and sale date)
/// keep the position of the first occurrence and the content of the last.
pub fn normalize_at(raw: &[RawRecord], now: DateTime<Utc>) -> Result<NormalizedRecords> {
    info!("Normalizing {} raw records", raw.len());

    let mut metadata = SourceMetadata::default();
    let mut per_source: BTreeMap<String, (usize, DateTime<Utc>)> = BTreeMap::new();

    let mut subject_attrs: Map<String, Value> = Map::new();
    let mut subject_provenance: Option<Provenance> = None;

    let mut comparables: Vec<ComparableSale> = Vec::new();
    let mut index_by_key: HashMap<(String, NaiveDate), usize> = HashMap::new();

    for (idx, record) in raw.iter().enumerate() {
        let provenance = Provenance {
            source: record.source.trim().to_string(),
            collected_at: record.collected_at.unwrap_or(now),
        };

        let entry = per_source
            .entry(provenance.source.clone())
            .or_insert((0, provenance.collected_at));
        entry.0 += 1;
        entry.1 = entry.1.max(provenance.collected_at);

        let attrs = canonical_attributes(&record.attributes);

        match record.role {
            RecordRole::Subject => {
                // Last source wins attribute by attribute
                for (key, value) in attrs {
                    subject_attrs.insert(key, value);
                }
                subject_provenance = Some(provenance);
            }
            RecordRole::Comparable => match parse_comparable(&attrs, provenance) {
                Ok(comp) => {
                    let key = (comp.address.to_lowercase(), comp.sale_date);
                    match index_by_key.get(&key) {
                        Some(&existing) => {
                            debug!(
                                "Replacing duplicate comparable {} sold {} (source: {})",
                                comp.address, comp.sale_date, comp.provenance.source
                            );
                            comparables[existing] = comp;
                            metadata.duplicates_replaced += 1;
                        }
                        None => {
                            index_by_key.insert(key, comparables.len());
                            comparables.push(comp);
                        }
                    }
                }
                Err(reason) => {
                    metadata.dropped_count += 1;
                    if metadata.dropped_count <= 10 {
                        // Only log first 10 drops
                        warn!("Dropping comparable #{}: {}", idx, reason);
                    }
                    metadata.drop_reasons.push(format!("record {}: {}", idx, reason));
                }
            },
        }
    }

    let subject_provenance = subject_provenance.ok_or_else(|| {
        ValuationError::malformed(Stage::Normalizer, "no subject property record supplied")
    })?;
    let subject = parse_subject(&subject_attrs)?;

    metadata.sources = per_source
        .into_iter()
        .map(|(source, (records, latest_collected_at))| SourceSummary {
            source,
            records,
            latest_collected_at,
        })
        .collect();

    info!(
        "Normalized subject '{}' with {} comparables ({} dropped, {} duplicates replaced)",
        subject.address,
        comparables.len(),
        metadata.dropped_count,
        metadata.duplicates_replaced
    );

    Ok(NormalizedRecords {
        subject,
        subject_provenance,
        comparables,
        source_metadata: metadata,
    })
}

/// Map provider-specific attribute names onto canonical ones, dropping nulls
fn canonical_attributes(attrs: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in attrs {
        if value.is_null() {
            continue;
        }
        let canonical = match key.trim().to_lowercase().as_str() {
            "square_feet" | "living_area_sqft" | "sqft" => "sqft".to_string(),
            "beds" | "bedrooms" => "bedrooms".to_string(),
            "baths" | "bathrooms" => "bathrooms".to_string(),
            "lot_size_acres" | "lot_size" => "lot_size".to_string(),
            "price" | "list_price" | "sale_price" | "purchase_price" => "sale_price".to_string(),
            "date" | "settlement_date" | "sale_date" => "sale_date".to_string(),
            "distance" | "distance_km" => "distance_km".to_string(),
            other => other.to_string(),
        };
        out.insert(canonical, value.clone());
    }
    out
}

fn parse_subject(attrs: &Map<String, Value>) -> Result<PropertyRecord> {
    let malformed = |detail: String| ValuationError::malformed(Stage::Normalizer, detail);

    let address = coerce_address(attrs.get("address"))
        .ok_or_else(|| malformed("subject is missing address".to_string()))?;

    let sqft = coerce_u32(attrs.get("sqft"))
        .map_err(|e| malformed(format!("subject sqft: {}", e)))?
        .filter(|&sqft| sqft > 0)
        .ok_or_else(|| malformed("subject is missing a positive sqft".to_string()))?;

    let common = parse_common(attrs).map_err(|e| malformed(format!("subject {}", e)))?;

    Ok(PropertyRecord {
        address,
        sqft,
        bedrooms: common.bedrooms,
        bathrooms: common.bathrooms,
        lot_size: common.lot_size,
        year_built: common.year_built,
        condition: common.condition,
        amenities: common.amenities,
    })
}

fn parse_comparable(
    attrs: &Map<String, Value>,
    provenance: Provenance,
) -> std::result::Result<ComparableSale, String> {
    let address = coerce_address(attrs.get("address")).ok_or("missing address")?;

    let sale_date = coerce_date(attrs.get("sale_date"))
        .map_err(|e| format!("{}: sale_date {}", address, e))?
        .ok_or_else(|| format!("{}: missing sale_date", address))?;

    let sqft = coerce_u32(attrs.get("sqft")).map_err(|e| format!("{}: sqft {}", address, e))?;
    if sqft == Some(0) {
        return Err(format!("{}: sqft must be positive", address));
    }

    let sale_price =
        coerce_f64(attrs.get("sale_price")).map_err(|e| format!("{}: sale_price {}", address, e))?;
    if matches!(sale_price, Some(p) if p <= 0.0) {
        return Err(format!("{}: sale_price must be positive", address));
    }

    let distance_km = coerce_non_negative(attrs.get("distance_km"))
        .map_err(|e| format!("{}: distance_km {}", address, e))?;

    let common = parse_common(attrs).map_err(|e| format!("{}: {}", address, e))?;

    Ok(ComparableSale {
        address,
        sqft,
        bedrooms: common.bedrooms,
        bathrooms: common.bathrooms,
        lot_size: common.lot_size,
        year_built: common.year_built,
        condition: common.condition,
        amenities: common.amenities,
        sale_price,
        sale_date,
        distance_km,
        provenance,
    })
}

struct CommonAttributes {
    bedrooms: Option<u32>,
    bathrooms: Option<f64>,
    lot_size: Option<f64>,
    year_built: Option<i32>,
    condition: Option<Condition>,
    amenities: BTreeSet<String>,
}

fn parse_common(attrs: &Map<String, Value>) -> std::result::Result<CommonAttributes, String> {
    let bedrooms = coerce_u32(attrs.get("bedrooms")).map_err(|e| format!("bedrooms {}", e))?;
    let bathrooms =
        coerce_non_negative(attrs.get("bathrooms")).map_err(|e| format!("bathrooms {}", e))?;
    let lot_size =
        coerce_non_negative(attrs.get("lot_size")).map_err(|e| format!("lot_size {}", e))?;

    let year_built = match coerce_f64(attrs.get("year_built")).map_err(|e| format!("year_built {}", e))? {
        Some(year) if year.fract() == 0.0 && (MIN_YEAR_BUILT..=MAX_YEAR_BUILT).contains(&(year as i64)) => {
            Some(year as i32)
        }
        Some(year) => return Err(format!("year_built {} is not plausible", year)),
        None => None,
    };

    let condition = match attrs.get("condition") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.parse::<Condition>()?),
        Some(Value::String(_)) | None => None,
        Some(other) => return Err(format!("condition has unexpected value {}", other)),
    };

    Ok(CommonAttributes {
        bedrooms,
        bathrooms,
        lot_size,
        year_built,
        condition,
        amenities: coerce_amenities(attrs.get("amenities")),
    })
}

/// Trim and collapse internal whitespace
pub fn canonical_address(address: &str) -> String {
    address.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn coerce_address(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => {
            let address = canonical_address(s);
            if address.is_empty() {
                None
            } else {
                Some(address)
            }
        }
        _ => None,
    }
}

/// Numbers or numeric strings such as "$450,000" or "2,150"
fn coerce_f64(value: Option<&Value>) -> std::result::Result<Option<f64>, String> {
    let parsed = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => {
            let clean = s.replace(['$', ','], "");
            let clean = clean.trim();
            if clean.is_empty() {
                return Ok(None);
            }
            clean.parse::<f64>().ok()
        }
        Some(_) => None,
    };

    match parsed {
        Some(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(format!("is not a number ({})", value.map(|v| v.to_string()).unwrap_or_default())),
    }
}

fn coerce_non_negative(value: Option<&Value>) -> std::result::Result<Option<f64>, String> {
    match coerce_f64(value)? {
        Some(v) if v < 0.0 => Err(format!("must be non-negative, got {}", v)),
        other => Ok(other),
    }
}

fn coerce_u32(value: Option<&Value>) -> std::result::Result<Option<u32>, String> {
    match coerce_non_negative(value)? {
        Some(v) if v.fract() != 0.0 => Err(format!("must be a whole number, got {}", v)),
        Some(v) if v > u32::MAX as f64 => Err(format!("is out of range, got {}", v)),
        Some(v) => Ok(Some(v as u32)),
        None => Ok(None),
    }
}

/// ISO dates, DD/MM/YYYY dates, or RFC 3339 timestamps
fn coerce_date(value: Option<&Value>) -> std::result::Result<Option<NaiveDate>, String> {
    let s = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s.trim(),
        Some(other) => return Err(format!("has unexpected value {}", other)),
    };
    if s.is_empty() {
        return Ok(None);
    }
    parse_date(s)
        .map(Some)
        .ok_or_else(|| format!("'{}' is not a recognised date", s))
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%d/%m/%Y"))
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
}

fn coerce_amenities(value: Option<&Value>) -> BTreeSet<String> {
    let tags: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };
    tags.into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}
