use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::TokenVerifier;
use crate::cache::Cache;
use crate::config::DispatchConfig;
use crate::engine::lifecycle::BookingManager;
use crate::engine::pricing::PricingEngine;
use crate::observability::metrics::Metrics;
use crate::realtime::BroadcastHub;
use crate::store::RecordStore;
use crate::tracking::LocationStore;

/// Collaborators and tunables the service is assembled from.
pub struct StateOptions {
    pub jwt_secret: String,
    pub location_ttl: Duration,
    pub dispatch: DispatchConfig,
    pub dispatch_queue_size: usize,
    pub connection_buffer_size: usize,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            jwt_secret: "local-development-secret".to_string(),
            location_ttl: Duration::from_secs(3_600),
            dispatch: DispatchConfig::default(),
            dispatch_queue_size: 1024,
            connection_buffer_size: 64,
        }
    }
}

pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub bookings: BookingManager,
    pub locations: LocationStore,
    pub hub: BroadcastHub,
    pub tokens: Arc<TokenVerifier>,
    pub dispatch_config: DispatchConfig,
    pub dispatch_tx: mpsc::Sender<Uuid>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cache: Arc<dyn Cache>,
        options: StateOptions,
    ) -> (Self, mpsc::Receiver<Uuid>) {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(options.dispatch_queue_size.max(1));
        let metrics = Metrics::new();
        let tokens = Arc::new(TokenVerifier::new(&options.jwt_secret));
        let locations = LocationStore::new(cache, options.location_ttl);

        let bookings = BookingManager::new(
            store.clone(),
            PricingEngine::default(),
            options.dispatch.clone(),
            metrics.clone(),
        );
        let hub = BroadcastHub::new(
            store.clone(),
            locations.clone(),
            tokens.clone(),
            options.connection_buffer_size,
            metrics.clone(),
        );

        (
            Self {
                store,
                bookings,
                locations,
                hub,
                tokens,
                dispatch_config: options.dispatch,
                dispatch_tx,
                metrics,
            },
            dispatch_rx,
        )
    }
}
