use std::sync::Arc;

use sqlx::PgPool;

pub mod audit;
pub mod billing;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod geofence;
pub mod ical;
pub mod middleware;
pub mod notify;
pub mod rate_limit;
pub mod retention;
pub mod router;
pub mod routes;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod utils;
pub mod wallet;

use audit::AuditSink;
use billing::{PaymentGateway, Renewer, SubscriptionGate, UsageLimiter};
use config::Config;
use crypto::Vault;
use geofence::GeofenceEngine;
use notify::{NotificationCenter, PushSubscriptionStore, center::Transports};
use rate_limit::{RateLimitStore, RateLimiter};
use retention::RetentionReaper;
use session::SessionResolver;
use storage::{ObjectStore, Uploader};
use utils::Clock;
use wallet::WalletLedger;

/// Vendor clients and swappable backends the components are built on.
pub struct Backends {
    pub rate_limit_store: Arc<dyn RateLimitStore>,
    pub transports: Transports,
    pub payment_gateway: Option<Arc<dyn PaymentGateway>>,
    pub object_store: Option<Arc<dyn ObjectStore>>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub vault: Arc<Vault>,
    pub clock: Arc<dyn Clock>,
    pub rate_limiter: RateLimiter,
    pub sessions: SessionResolver,
    pub audit: AuditSink,
    pub notifications: Arc<NotificationCenter>,
    pub push_subscriptions: PushSubscriptionStore,
    pub geofences: GeofenceEngine,
    pub subscriptions: SubscriptionGate,
    pub limits: UsageLimiter,
    /// Absent when no payment gateway is configured.
    pub renewer: Option<Arc<Renewer>>,
    pub wallet: WalletLedger,
    pub reaper: RetentionReaper,
    /// Absent when no object storage is configured.
    pub uploader: Option<Arc<Uploader>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Arc<Config>, vault: Arc<Vault>, backends: Backends) -> Self {
        let audit = AuditSink::new(pool.clone());
        let notifications = Arc::new(NotificationCenter::new(pool.clone(), backends.transports));
        let renewer = backends.payment_gateway.map(|gateway| {
            Arc::new(Renewer::new(
                pool.clone(),
                gateway,
                notifications.clone(),
                audit.clone(),
            ))
        });
        let uploader = backends
            .object_store
            .map(|store| Arc::new(Uploader::new(pool.clone(), store)));

        Self {
            rate_limiter: RateLimiter::with_clock(backends.rate_limit_store, backends.clock.clone()),
            sessions: SessionResolver::new(pool.clone()),
            push_subscriptions: PushSubscriptionStore::new(pool.clone()),
            geofences: GeofenceEngine::new(pool.clone(), config.geofence_accuracy_threshold_m),
            subscriptions: SubscriptionGate::new(pool.clone()),
            limits: UsageLimiter::new(pool.clone()),
            wallet: WalletLedger::new(pool.clone()),
            reaper: RetentionReaper::new(pool.clone()),
            clock: backends.clock,
            audit,
            notifications,
            renewer,
            uploader,
            vault,
            config,
            pool,
        }
    }
}
