//! Department projections of the catalog.
//!
//! [`shape`] is a pure function: every projection has exactly one record per
//! catalog item, in catalog order, carrying only the fields that department
//! uses.

use serde::Serialize;
use std::fmt;

use crate::emit;
use crate::metrics::events::ProjectionShaped;
use crate::source::CatalogItem;

/// Names of the fixed projections, in publish order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionName {
    Sales,
    Product,
    Finance,
}

impl ProjectionName {
    pub const ALL: [ProjectionName; 3] = [
        ProjectionName::Sales,
        ProjectionName::Product,
        ProjectionName::Finance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionName::Sales => "sales",
            ProjectionName::Product => "product",
            ProjectionName::Finance => "finance",
        }
    }

    /// Warehouse table holding this projection.
    pub fn table_name(&self) -> String {
        format!("{}_products", self.as_str())
    }
}

impl fmt::Display for ProjectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sales department view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SalesRecord {
    pub title: String,
    pub price: f64,
    pub category: String,
}

/// Product department view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductRecord {
    pub title: String,
    pub description: String,
    pub image: String,
}

/// Finance department view. `rating` serializes as `null` when the item has
/// no well-formed rating.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinanceRecord {
    pub id: i64,
    pub price: f64,
    pub rating: Option<f64>,
}

impl From<&CatalogItem> for SalesRecord {
    fn from(item: &CatalogItem) -> Self {
        Self {
            title: item.title.clone(),
            price: item.price,
            category: item.category.clone(),
        }
    }
}

impl From<&CatalogItem> for ProductRecord {
    fn from(item: &CatalogItem) -> Self {
        Self {
            title: item.title.clone(),
            description: item.description.clone(),
            image: item.image.clone(),
        }
    }
}

impl From<&CatalogItem> for FinanceRecord {
    fn from(item: &CatalogItem) -> Self {
        Self {
            id: item.id,
            price: item.price,
            rating: item.rating.rate(),
        }
    }
}

/// All three projections of one catalog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectionSet {
    pub sales: Vec<SalesRecord>,
    pub product: Vec<ProductRecord>,
    pub finance: Vec<FinanceRecord>,
}

/// Borrowed view of one projection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection<'a> {
    Sales(&'a [SalesRecord]),
    Product(&'a [ProductRecord]),
    Finance(&'a [FinanceRecord]),
}

impl ProjectionSet {
    pub fn get(&self, name: ProjectionName) -> Projection<'_> {
        match name {
            ProjectionName::Sales => Projection::Sales(&self.sales),
            ProjectionName::Product => Projection::Product(&self.product),
            ProjectionName::Finance => Projection::Finance(&self.finance),
        }
    }

    /// Projections in publish order.
    pub fn iter(&self) -> impl Iterator<Item = (ProjectionName, Projection<'_>)> {
        ProjectionName::ALL
            .into_iter()
            .map(move |name| (name, self.get(name)))
    }

    /// Number of catalog items the set was shaped from.
    pub fn len(&self) -> usize {
        self.sales.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sales.is_empty()
    }
}

impl Projection<'_> {
    pub fn len(&self) -> usize {
        match self {
            Projection::Sales(records) => records.len(),
            Projection::Product(records) => records.len(),
            Projection::Finance(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render the projection as one pretty-printed JSON array.
    pub fn to_pretty_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Projection::Sales(records) => serde_json::to_vec_pretty(records),
            Projection::Product(records) => serde_json::to_vec_pretty(records),
            Projection::Finance(records) => serde_json::to_vec_pretty(records),
        }
    }

    /// Render the projection as newline-delimited JSON, one row per line.
    pub fn to_ndjson(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Projection::Sales(records) => encode_ndjson(records),
            Projection::Product(records) => encode_ndjson(records),
            Projection::Finance(records) => encode_ndjson(records),
        }
    }
}

fn encode_ndjson<T: Serialize>(records: &[T]) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::new();
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            out.push(b'\n');
        }
        serde_json::to_writer(&mut out, record)?;
    }
    Ok(out)
}

/// Reshape a catalog into the department projections.
pub fn shape(catalog: &[CatalogItem]) -> ProjectionSet {
    let set = ProjectionSet {
        sales: catalog.iter().map(SalesRecord::from).collect(),
        product: catalog.iter().map(ProductRecord::from).collect(),
        finance: catalog.iter().map(FinanceRecord::from).collect(),
    };

    for (name, projection) in set.iter() {
        emit!(ProjectionShaped {
            projection: name,
            records: projection.len() as u64,
        });
    }

    set
}
