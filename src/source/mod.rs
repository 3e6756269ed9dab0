//! Catalog extraction.
//!
//! Defines the catalog record model and the [`CatalogSource`] trait the
//! pipeline fetches from. The production source is [`HttpCatalogSource`].

mod http;

pub use http::{DEFAULT_CATALOG_URL, HttpCatalogSource};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ExtractError;

/// The full set of catalog records fetched in one run, in upstream order.
pub type Catalog = Vec<CatalogItem>;

/// One product record from the upstream catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: i64,
    pub title: String,
    pub price: f64,
    pub category: String,
    pub description: String,
    pub image: String,
    #[serde(default, deserialize_with = "deserialize_rating")]
    pub rating: Rating,
}

/// Presence state of a catalog item's rating.
///
/// The upstream `rating` field is optional and loosely shaped. Anything other
/// than an object with a numeric `rate` is kept as `Absent` or `Malformed`
/// instead of failing the whole catalog.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum Rating {
    Rated {
        rate: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        count: Option<u64>,
    },
    /// The `rating` field is missing or null.
    #[default]
    Absent,
    /// The `rating` field exists but has no numeric `rate`.
    Malformed(serde_json::Value),
}

impl Rating {
    /// The rating rate, if present and well-formed.
    pub fn rate(&self) -> Option<f64> {
        match self {
            Rating::Rated { rate, .. } => Some(*rate),
            Rating::Absent | Rating::Malformed(_) => None,
        }
    }

    fn from_value(value: serde_json::Value) -> Self {
        if value.is_null() {
            return Rating::Absent;
        }

        match value.get("rate").and_then(serde_json::Value::as_f64) {
            Some(rate) => Rating::Rated {
                rate,
                count: value.get("count").and_then(serde_json::Value::as_u64),
            },
            None => Rating::Malformed(value),
        }
    }
}

fn deserialize_rating<'de, D>(deserializer: D) -> Result<Rating, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(Rating::from_value(value))
}

/// Parse a catalog payload.
pub fn parse_catalog(bytes: &[u8]) -> Result<Catalog, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// A place the pipeline can fetch the full catalog from.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch the complete catalog with a single attempt.
    async fn fetch(&self) -> Result<Catalog, ExtractError>;

    /// Human-readable location of the catalog, used in logs.
    fn describe(&self) -> String;
}
