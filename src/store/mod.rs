//! Record store collaborator.
//!
//! The search engine only knows post ids; everything a caller wants to display
//! lives in the record store. The relational/geospatial database used in
//! production sits behind [`RecordStore`]; [`InMemoryRecordStore`] serves the
//! same contract from a JSON dump of the records.

mod memory;

pub use memory::InMemoryRecordStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::geo::GeoPoint;

/// Identifier shared by the record store and the embedding corpus.
pub type PostId = i64;

/// A delivery post office record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPost {
    pub id: PostId,
    pub office_name: String,
    #[serde(default)]
    pub pincode: Option<u32>,
    /// e.g. "HO", "SO", "BO"
    #[serde(default)]
    pub office_type: Option<String>,
    /// "Delivery" or "Non-Delivery"
    #[serde(default)]
    pub delivery_status: Option<String>,
    #[serde(default)]
    pub division_name: Option<String>,
    #[serde(default)]
    pub region_name: Option<String>,
    #[serde(default)]
    pub circle_name: Option<String>,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub state_name: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl DeliveryPost {
    /// Coordinates, when both are present and finite.
    pub fn location(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => {
                Some(GeoPoint::new(lat, lon))
            }
            _ => None,
        }
    }

    /// Text the corpus embedding was generated from: office, district, state.
    pub fn corpus_text(&self) -> String {
        [
            Some(self.office_name.as_str()),
            self.district.as_deref(),
            self.state_name.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
    }
}

/// Aggregate counts over the stored records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_posts: usize,
    /// Records with both coordinates, i.e. reachable by geo search.
    pub with_coordinates: usize,
    pub delivery_offices: usize,
    pub states: usize,
    pub districts: usize,
}

/// Access to the persisted delivery post records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch the records for `ids`. No particular order is guaranteed and
    /// unknown ids are simply absent from the result.
    async fn fetch_by_ids(&self, ids: &[PostId]) -> Result<Vec<DeliveryPost>>;

    /// Ids of all records within `radius_km` of `center`.
    async fn fetch_within_radius(&self, center: GeoPoint, radius_km: f64) -> Result<Vec<PostId>>;

    /// Non-semantic text match on office name, district, state and pincode.
    async fn fetch_by_prefix(&self, text: &str, limit: usize) -> Result<Vec<DeliveryPost>>;

    /// Look up a single record by its 6-digit pincode.
    async fn fetch_by_pincode(&self, pincode: u32) -> Result<Option<DeliveryPost>>;

    /// Number of stored records.
    async fn count(&self) -> Result<usize>;

    /// A page of records in storage order.
    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<DeliveryPost>>;

    /// Distinct state names, sorted.
    async fn states(&self) -> Result<Vec<String>>;

    /// Distinct district names within `state`, sorted.
    async fn districts(&self, state: &str) -> Result<Vec<String>>;

    /// A page of the records in `district`, in storage order.
    async fn fetch_by_district(
        &self,
        district: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DeliveryPost>>;

    async fn stats(&self) -> Result<StoreStats>;
}
