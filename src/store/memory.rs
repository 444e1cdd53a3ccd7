//! Record store backed by an in-memory copy of the post records.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use super::{DeliveryPost, PostId, RecordStore, StoreStats};
use crate::error::{Error, Result};
use crate::geo::GeoPoint;

/// Queries this short use substring matching instead of word prefixes.
const SHORT_QUERY_CHARS: usize = 2;

/// All records held in memory, indexed by id.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    posts: Vec<DeliveryPost>,
    by_id: HashMap<PostId, usize>,
    by_pincode: HashMap<u32, usize>,
}

impl InMemoryRecordStore {
    /// Build a store from records. Later duplicates of an id replace earlier ones.
    pub fn from_posts(posts: Vec<DeliveryPost>) -> Self {
        let mut store = Self::default();
        for post in posts {
            match store.by_id.get(&post.id) {
                Some(&idx) => store.posts[idx] = post,
                None => {
                    store.by_id.insert(post.id, store.posts.len());
                    store.posts.push(post);
                }
            }
        }
        for (idx, post) in store.posts.iter().enumerate() {
            if let Some(pincode) = post.pincode {
                // First office registered for a pincode wins.
                store.by_pincode.entry(pincode).or_insert(idx);
            }
        }
        store
    }

    /// Load records from a JSON array file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            Error::Store(format!("cannot read records '{}': {}", path.display(), e))
        })?;
        let posts: Vec<DeliveryPost> = serde_json::from_slice(&bytes)?;
        let store = Self::from_posts(posts);
        info!("Loaded {} post records from {}", store.len(), path.display());
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    /// All records in storage order.
    pub fn posts(&self) -> &[DeliveryPost] {
        &self.posts
    }
}

fn searchable_fields(post: &DeliveryPost) -> impl Iterator<Item = &str> {
    [
        Some(post.office_name.as_str()),
        post.district.as_deref(),
        post.state_name.as_deref(),
        post.division_name.as_deref(),
        post.region_name.as_deref(),
        post.circle_name.as_deref(),
    ]
    .into_iter()
    .flatten()
}

fn matches_text(post: &DeliveryPost, query: &str) -> bool {
    let pincode = post.pincode.map(|p| p.to_string()).unwrap_or_default();

    if query.chars().count() <= SHORT_QUERY_CHARS {
        return searchable_fields(post)
            .take(3)
            .any(|field| field.to_lowercase().contains(query))
            || pincode.contains(query);
    }

    let tokens: Vec<String> = searchable_fields(post)
        .flat_map(|field| field.split_whitespace())
        .map(|word| word.to_lowercase())
        .chain(std::iter::once(pincode))
        .collect();
    query
        .split_whitespace()
        .all(|word| tokens.iter().any(|token| token.starts_with(word)))
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn fetch_by_ids(&self, ids: &[PostId]) -> Result<Vec<DeliveryPost>> {
        let wanted: HashSet<PostId> = ids.iter().copied().collect();
        // Storage order, not request order.
        Ok(self
            .posts
            .iter()
            .filter(|post| wanted.contains(&post.id))
            .cloned()
            .collect())
    }

    async fn fetch_within_radius(&self, center: GeoPoint, radius_km: f64) -> Result<Vec<PostId>> {
        Ok(self
            .posts
            .iter()
            .filter_map(|post| post.location().map(|loc| (post.id, center.distance_km(&loc))))
            .filter(|(_, distance)| *distance <= radius_km)
            .map(|(id, _)| id)
            .collect())
    }

    async fn fetch_by_prefix(&self, text: &str, limit: usize) -> Result<Vec<DeliveryPost>> {
        let query = text.trim().to_lowercase();
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut matches: Vec<&DeliveryPost> = self
            .posts
            .iter()
            .filter(|post| matches_text(post, &query))
            .collect();
        // Office-name prefix hits first.
        matches.sort_by_key(|post| (!post.office_name.to_lowercase().starts_with(&query), post.id));
        Ok(matches.into_iter().take(limit).cloned().collect())
    }

    async fn fetch_by_pincode(&self, pincode: u32) -> Result<Option<DeliveryPost>> {
        Ok(self
            .by_pincode
            .get(&pincode)
            .map(|&idx| self.posts[idx].clone()))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.posts.len())
    }

    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<DeliveryPost>> {
        Ok(self.posts.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn states(&self) -> Result<Vec<String>> {
        let states: BTreeSet<&str> = self
            .posts
            .iter()
            .filter_map(|post| post.state_name.as_deref())
            .collect();
        Ok(states.into_iter().map(str::to_string).collect())
    }

    async fn districts(&self, state: &str) -> Result<Vec<String>> {
        let districts: BTreeSet<&str> = self
            .posts
            .iter()
            .filter(|post| post.state_name.as_deref() == Some(state))
            .filter_map(|post| post.district.as_deref())
            .collect();
        Ok(districts.into_iter().map(str::to_string).collect())
    }

    async fn fetch_by_district(
        &self,
        district: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DeliveryPost>> {
        Ok(self
            .posts
            .iter()
            .filter(|post| post.district.as_deref() == Some(district))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let mut states = BTreeSet::new();
        let mut districts = BTreeSet::new();
        let mut stats = StoreStats {
            total_posts: self.posts.len(),
            ..StoreStats::default()
        };
        for post in &self.posts {
            if post.location().is_some() {
                stats.with_coordinates += 1;
            }
            if post.delivery_status.as_deref() == Some("Delivery") {
                stats.delivery_offices += 1;
            }
            if let Some(state) = post.state_name.as_deref() {
                states.insert(state);
                if let Some(district) = post.district.as_deref() {
                    districts.insert((state, district));
                }
            }
        }
        stats.states = states.len();
        stats.districts = districts.len();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sample_posts;
    use tempfile::tempdir;

    fn store() -> InMemoryRecordStore {
        InMemoryRecordStore::from_posts(sample_posts())
    }

    #[tokio::test]
    async fn test_fetch_by_ids_skips_unknown_ids() {
        let posts = store().fetch_by_ids(&[3, 99, 1]).await.unwrap();
        let mut ids: Vec<_> = posts.iter().map(|p| p.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_fetch_within_radius() {
        let mumbai = GeoPoint::new(19.07, 72.87);
        let ids = store().fetch_within_radius(mumbai, 50.0).await.unwrap();
        assert_eq!(ids, vec![1]);

        let ids = store().fetch_within_radius(mumbai, 200.0).await.unwrap();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_fetch_by_prefix_word_prefixes() {
        let posts = store().fetch_by_prefix("mum gp", 10).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, 1);

        let posts = store().fetch_by_prefix("GPO", 10).await.unwrap();
        let ids: Vec<_> = posts.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_fetch_by_prefix_short_query_uses_substring() {
        let posts = store().fetch_by_prefix("ne", 10).await.unwrap();
        // "Pune HO"
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, 2);
    }

    #[tokio::test]
    async fn test_fetch_by_prefix_pincode() {
        let posts = store().fetch_by_prefix("4110", 10).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].office_name, "Pune HO");
    }

    #[tokio::test]
    async fn test_fetch_by_pincode() {
        let post = store().fetch_by_pincode(110001).await.unwrap();
        assert_eq!(post.map(|p| p.id), Some(3));
        assert!(store().fetch_by_pincode(999999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_from_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("posts.json");
        std::fs::write(&path, serde_json::to_vec(&sample_posts()).unwrap()).unwrap();

        let store = InMemoryRecordStore::load(&path).unwrap();
        assert_eq!(store.count().await.unwrap(), 3);
    }

    // ========================================================================
    // Listing and locations
    // ========================================================================

    #[tokio::test]
    async fn test_list_pages_in_storage_order() {
        let store = store();
        let ids = |posts: Vec<DeliveryPost>| posts.iter().map(|p| p.id).collect::<Vec<_>>();
        assert_eq!(ids(store.list(0, 2).await.unwrap()), vec![1, 2]);
        assert_eq!(ids(store.list(2, 2).await.unwrap()), vec![3]);
        assert!(store.list(10, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_states_and_districts_are_distinct_and_sorted() {
        let store = store();
        assert_eq!(store.states().await.unwrap(), vec!["Delhi", "Maharashtra"]);
        assert_eq!(
            store.districts("Maharashtra").await.unwrap(),
            vec!["Mumbai", "Pune"]
        );
        assert!(store.districts("Goa").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_by_district() {
        let posts = store().fetch_by_district("Pune", 0, 10).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].office_name, "Pune HO");
        assert!(store().fetch_by_district("Pune", 1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats() {
        let stats = store().stats().await.unwrap();
        assert_eq!(stats.total_posts, 3);
        assert_eq!(stats.with_coordinates, 3);
        assert_eq!(stats.states, 2);
        assert_eq!(stats.districts, 3);
    }

    #[test]
    fn test_load_missing_file_is_store_error() {
        let dir = tempdir().unwrap();
        let err = InMemoryRecordStore::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }
}
