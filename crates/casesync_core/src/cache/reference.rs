//! Reference lists used to fill form pick-lists.
//!
//! Lists change rarely and are needed in the field, where coverage is poor,
//! so every successful download is cached and served back when offline.
//! Each category has a freshness window; a cached list younger than that is
//! served without asking the server unless a refresh is forced.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CacheKey, CacheStore, Loaded};
use crate::api::ReferenceApi;
use crate::error::{CacheError, CacheResult};

/// A reference-data list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceCategory {
    /// Client firms.
    Firms,
    /// Staff directory.
    Users,
    /// Ambulances.
    Vehicles,
    /// Stations and bases.
    Locations,
    /// Medication catalogue.
    Medications,
    /// Destination hospitals.
    Hospitals,
}

impl ReferenceCategory {
    /// Every category, in the order they are preloaded.
    pub const ALL: [ReferenceCategory; 6] = [
        ReferenceCategory::Firms,
        ReferenceCategory::Users,
        ReferenceCategory::Vehicles,
        ReferenceCategory::Locations,
        ReferenceCategory::Medications,
        ReferenceCategory::Hospitals,
    ];

    /// Wire and cache name.
    pub fn as_str(self) -> &'static str {
        match self {
            ReferenceCategory::Firms => "firms",
            ReferenceCategory::Users => "users",
            ReferenceCategory::Vehicles => "vehicles",
            ReferenceCategory::Locations => "locations",
            ReferenceCategory::Medications => "medications",
            ReferenceCategory::Hospitals => "hospitals",
        }
    }

    /// How long a downloaded list stays current.
    pub fn freshness(self) -> Duration {
        match self {
            ReferenceCategory::Firms => Duration::hours(24),
            ReferenceCategory::Users => Duration::hours(12),
            ReferenceCategory::Vehicles => Duration::hours(6),
            ReferenceCategory::Locations => Duration::hours(24),
            ReferenceCategory::Medications => Duration::hours(24),
            ReferenceCategory::Hospitals => Duration::days(7),
        }
    }

    /// Parse a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for ReferenceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A loaded reference list.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceList {
    /// Which list this is.
    pub category: ReferenceCategory,
    /// List items as sent by the server.
    pub items: Vec<Value>,
    /// Whether the list was served from the cache.
    pub from_cache: bool,
    /// When the served copy was cached (`None` for a live download).
    pub cached_at: Option<DateTime<Utc>>,
}

impl ReferenceList {
    /// Whether the list is within its category's freshness window.
    pub fn is_current(&self) -> bool {
        self.cached_at
            .is_none_or(|at| Utc::now() - at < self.category.freshness())
    }
}

/// Loads reference lists through the cache.
pub struct ReferenceData {
    api: Arc<dyn ReferenceApi>,
    cache: Arc<CacheStore>,
}

impl ReferenceData {
    /// Create a loader.
    pub fn new(api: Arc<dyn ReferenceApi>, cache: Arc<CacheStore>) -> Self {
        Self { api, cache }
    }

    /// Load one list.
    ///
    /// A cached copy within the freshness window is served as is. Otherwise
    /// the list is downloaded when `online`, falling back to any cached copy.
    pub async fn load(&self, category: ReferenceCategory, online: bool) -> CacheResult<ReferenceList> {
        self.load_with(category, online, false).await
    }

    /// Like [`load`](Self::load), but downloads even when the cached copy is current.
    pub async fn refresh(&self, category: ReferenceCategory, online: bool) -> CacheResult<ReferenceList> {
        self.load_with(category, online, true).await
    }

    async fn load_with(
        &self,
        category: ReferenceCategory,
        online: bool,
        force: bool,
    ) -> CacheResult<ReferenceList> {
        if online
            && !force
            && let Some(list) = self.current(category)
        {
            log::debug!("[ReferenceData] {} is current, skipping download", category);
            return Ok(list);
        }

        let key = CacheKey::reference(category);
        let api = Arc::clone(&self.api);
        let Loaded {
            payload,
            from_cache,
            cached_at,
        } = self
            .cache
            .load_through(&key, online, || async move { api.reference_list(category).await })
            .await?;

        Ok(ReferenceList {
            category,
            items: items_of(payload),
            from_cache,
            cached_at,
        })
    }

    /// The cached copy, if it is still within the freshness window.
    fn current(&self, category: ReferenceCategory) -> Option<ReferenceList> {
        match Self::cached(&self.cache, category) {
            Ok(list) if list.is_current() => Some(list),
            Ok(_) | Err(CacheError::Miss(_)) => None,
            Err(e) => {
                log::warn!("[ReferenceData] Could not read cached {}: {}", category, e);
                None
            }
        }
    }

    /// Read one list from the cache without touching the network.
    pub fn cached(cache: &CacheStore, category: ReferenceCategory) -> CacheResult<ReferenceList> {
        let key = CacheKey::reference(category);
        match cache.get(&key)? {
            Some(snapshot) => Ok(ReferenceList {
                category,
                items: items_of(snapshot.payload),
                from_cache: true,
                cached_at: Some(snapshot.cached_at),
            }),
            None => Err(CacheError::Miss(key)),
        }
    }

    /// Bring every list up to date, downloading only stale ones unless
    /// `force` is set. Failures are logged and reported per category.
    pub async fn preload(
        &self,
        online: bool,
        force: bool,
    ) -> Vec<(ReferenceCategory, CacheResult<ReferenceList>)> {
        let mut results = Vec::with_capacity(ReferenceCategory::ALL.len());
        for category in ReferenceCategory::ALL {
            let result = self.load_with(category, online, force).await;
            match &result {
                Ok(list) => log::debug!(
                    "[ReferenceData] {} loaded ({} items, from_cache={})",
                    category,
                    list.items.len(),
                    list.from_cache
                ),
                Err(CacheError::Miss(_)) => {
                    log::warn!("[ReferenceData] {} unavailable offline", category)
                }
                Err(e) => log::warn!("[ReferenceData] {} failed: {}", category, e),
            }
            results.push((category, result));
        }
        results
    }
}

/// Servers return either a bare array or an object with an `items` array.
fn items_of(payload: Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheBackend, CacheSnapshot, FetchStamp, MemoryCacheBackend};
    use crate::test_utils::MockReferenceApi;
    use serde_json::json;

    #[tokio::test]
    async fn test_reference_list_is_cached_and_served_offline() {
        let api = Arc::new(MockReferenceApi::new());
        api.set_list(ReferenceCategory::Hospitals, json!([{"id": 1, "name": "Şehir Hastanesi"}]));
        let cache = Arc::new(CacheStore::in_memory());
        let data = ReferenceData::new(api.clone(), cache.clone());

        let live = data.load(ReferenceCategory::Hospitals, true).await.unwrap();
        assert!(!live.from_cache);
        assert_eq!(live.items.len(), 1);

        let offline = data.load(ReferenceCategory::Hospitals, false).await.unwrap();
        assert!(offline.from_cache);
        assert_eq!(offline.items, live.items);
        assert_eq!(api.calls(), 1);

        let cached = ReferenceData::cached(&cache, ReferenceCategory::Hospitals).unwrap();
        assert_eq!(cached.items, live.items);
        assert!(matches!(
            ReferenceData::cached(&cache, ReferenceCategory::Firms),
            Err(CacheError::Miss(_))
        ));
    }

    #[tokio::test]
    async fn test_wrapped_items_and_missing_lists() {
        let api = Arc::new(MockReferenceApi::new());
        api.set_list(ReferenceCategory::Vehicles, json!({"items": ["34 ABC 12"]}));
        let data = ReferenceData::new(api, Arc::new(CacheStore::in_memory()));

        let vehicles = data.load(ReferenceCategory::Vehicles, true).await.unwrap();
        assert_eq!(vehicles.items, vec![json!("34 ABC 12")]);

        let results = data.preload(true, false).await;
        assert_eq!(results.len(), 6);
        let firms = &results[0];
        assert_eq!(firms.0, ReferenceCategory::Firms);
        assert!(matches!(firms.1, Err(CacheError::Miss(_))));
    }

    fn aged(category: ReferenceCategory, list: Value, age: Duration) -> CacheStore {
        let backend = MemoryCacheBackend::new();
        backend
            .store(&CacheSnapshot {
                key: CacheKey::reference(category),
                payload: list,
                cached_at: Utc::now() - age,
                stamp: FetchStamp(1),
            })
            .unwrap();
        CacheStore::new(backend)
    }

    #[tokio::test]
    async fn test_current_list_is_not_downloaded_again() {
        let api = Arc::new(MockReferenceApi::new());
        api.set_list(ReferenceCategory::Users, json!(["u-1"]));
        let cache = Arc::new(CacheStore::in_memory());
        let data = ReferenceData::new(api.clone(), cache);

        assert!(!data.load(ReferenceCategory::Users, true).await.unwrap().from_cache);
        let again = data.load(ReferenceCategory::Users, true).await.unwrap();
        assert!(again.from_cache);
        assert!(again.is_current());
        assert_eq!(api.calls(), 1);

        api.set_list(ReferenceCategory::Users, json!(["u-1", "u-2"]));
        let refreshed = data.refresh(ReferenceCategory::Users, true).await.unwrap();
        assert!(!refreshed.from_cache);
        assert_eq!(refreshed.items.len(), 2);
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test]
    async fn test_stale_list_is_downloaded() {
        let api = Arc::new(MockReferenceApi::new());
        api.set_list(ReferenceCategory::Vehicles, json!(["34 ABC 12", "06 XYZ 99"]));
        let cache = aged(ReferenceCategory::Vehicles, json!(["34 ABC 12"]), Duration::hours(7));
        let data = ReferenceData::new(api.clone(), Arc::new(cache));

        let offline = data.load(ReferenceCategory::Vehicles, false).await.unwrap();
        assert!(offline.from_cache);
        assert!(!offline.is_current());
        assert_eq!(api.calls(), 0);

        let vehicles = data.load(ReferenceCategory::Vehicles, true).await.unwrap();
        assert!(!vehicles.from_cache);
        assert_eq!(vehicles.items.len(), 2);
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn test_preload_skips_current_lists_unless_forced() {
        let api = Arc::new(MockReferenceApi::new());
        for category in ReferenceCategory::ALL {
            api.set_list(category, json!([category.as_str()]));
        }
        let cache = aged(ReferenceCategory::Hospitals, json!(["cached"]), Duration::hours(7));
        let data = ReferenceData::new(api.clone(), Arc::new(cache));

        let results = data.preload(true, false).await;
        assert!(results.iter().all(|(_, result)| result.is_ok()));
        assert_eq!(api.calls(), 5);
        let hospitals = results
            .into_iter()
            .find(|(category, _)| *category == ReferenceCategory::Hospitals)
            .unwrap()
            .1
            .unwrap();
        assert_eq!(hospitals.items, vec![json!("cached")]);

        data.preload(true, true).await;
        assert_eq!(api.calls(), 11);
        let hospitals = ReferenceData::cached(&data.cache, ReferenceCategory::Hospitals).unwrap();
        assert_eq!(hospitals.items, vec![json!("hospitals")]);
    }
}
