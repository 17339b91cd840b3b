//! Last-known positions per booking, kept in the cache under `location:<booking id>`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::Cache;
use crate::error::AppError;
use crate::models::location::GeoPoint;

#[derive(Clone)]
pub struct LocationStore {
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl LocationStore {
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn key(booking_id: Uuid) -> String {
        format!("location:{booking_id}")
    }

    pub async fn record_position(&self, booking_id: Uuid, position: GeoPoint) -> Result<(), AppError> {
        let value = serde_json::to_string(&position)
            .map_err(|err| AppError::Internal(format!("failed to encode position: {err}")))?;

        self.cache
            .set_ex(&Self::key(booking_id), value, self.ttl)
            .await
            .inspect_err(|err| warn!(booking_id = %booking_id, error = %err, "failed to record position"))?;

        debug!(booking_id = %booking_id, lat = position.lat, lng = position.lng, "position recorded");
        Ok(())
    }

    pub async fn read_position(&self, booking_id: Uuid) -> Result<Option<GeoPoint>, AppError> {
        let Some(raw) = self.cache.get(&Self::key(booking_id)).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(position) => Ok(Some(position)),
            Err(err) => {
                warn!(booking_id = %booking_id, error = %err, "discarding malformed cached position");
                Ok(None)
            }
        }
    }

    /// Removes positions of trackers that stopped reporting.
    pub async fn purge_expired(&self) -> Result<usize, AppError> {
        Ok(self.cache.purge_expired().await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::LocationStore;
    use crate::cache::{Cache, CacheError, MemoryCache};
    use crate::error::AppError;
    use crate::models::location::GeoPoint;

    struct DownCache;

    #[async_trait]
    impl Cache for DownCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }

        async fn set_ex(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn read_after_write_returns_latest_position() {
        let store = LocationStore::new(Arc::new(MemoryCache::new()), Duration::from_secs(3600));
        let booking_id = Uuid::new_v4();

        store
            .record_position(booking_id, GeoPoint { lat: 1.0, lng: 2.0 })
            .await
            .unwrap();
        store
            .record_position(booking_id, GeoPoint { lat: 1.5, lng: 2.5 })
            .await
            .unwrap();

        let position = store.read_position(booking_id).await.unwrap();
        assert_eq!(position, Some(GeoPoint { lat: 1.5, lng: 2.5 }));
    }

    #[tokio::test]
    async fn unknown_booking_has_no_position() {
        let store = LocationStore::new(Arc::new(MemoryCache::new()), Duration::from_secs(3600));
        assert_eq!(store.read_position(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cache_outage_surfaces_as_store_unavailable() {
        let store = LocationStore::new(Arc::new(DownCache), Duration::from_secs(3600));
        let booking_id = Uuid::new_v4();

        let write = store
            .record_position(booking_id, GeoPoint { lat: 0.0, lng: 0.0 })
            .await;
        assert!(matches!(write, Err(AppError::StoreUnavailable(_))));

        let read = store.read_position(booking_id).await;
        assert!(matches!(read, Err(AppError::StoreUnavailable(_))));
    }

    #[test]
    fn key_schema() {
        let id = Uuid::from_u128(7);
        assert_eq!(
            LocationStore::key(id),
            "location:00000000-0000-0000-0000-000000000007"
        );
    }
}
