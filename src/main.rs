use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use family_backend::{
    AppState, Backends,
    billing::{PaymentGateway, YooKassaGateway},
    cache::RedisRateLimitStore,
    config::Config,
    crypto::Vault,
    notify::{
        EmailTransport, PushTransport, SmsTransport, WebPushClient, center::Transports,
        email::SmtpMailer, sms::SmsGateway,
    },
    rate_limit::{PgRateLimitStore, RateLimitStore},
    router::create_router,
    scheduler::Scheduler,
    storage::{ObjectStore, S3Store},
    utils::SystemClock,
};
use sqlx::Executor;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=info".into()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_transports(config: &Config) -> Transports {
    let push = config.vapid.as_ref().map(|vapid| {
        Arc::new(WebPushClient::new(vapid, config.push_timeout()).expect("Invalid VAPID configuration"))
            as Arc<dyn PushTransport>
    });
    let email = config.smtp.as_ref().map(|smtp| {
        Arc::new(SmtpMailer::new(smtp, config.smtp_timeout()).expect("Invalid SMTP configuration"))
            as Arc<dyn EmailTransport>
    });
    let sms = config.sms.as_ref().map(|sms| {
        Arc::new(SmsGateway::new(sms, config.helper_timeout()).expect("Invalid SMS configuration"))
            as Arc<dyn SmsTransport>
    });

    tracing::info!(
        push = push.is_some(),
        email = email.is_some(),
        sms = sms.is_some(),
        "notification channels"
    );
    Transports { push, email, sms }
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
    token.cancel();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = Arc::new(Config::from_env().expect("Failed to load configuration"));

    // a key of the wrong length aborts start-up
    let vault = Arc::new(
        Vault::from_config(config.encryption_key.as_deref(), config.legacy_plaintext_cutoff)
            .expect("Invalid ENCRYPTION_KEY"),
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("SET application_name = 'family_backend';").await?;
                Ok(())
            })
        })
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to Postgres");

    if config.run_migrations {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");
    }

    let rate_limit_store: Arc<dyn RateLimitStore> = match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str()).expect("Failed to create Redis client");
            tracing::info!("rate limit counters in redis");
            Arc::new(RedisRateLimitStore::new(Arc::new(client)))
        }
        None => Arc::new(PgRateLimitStore::new(pool.clone())),
    };

    let payment_gateway = config.payment.as_ref().map(|payment| {
        Arc::new(
            YooKassaGateway::new(payment, config.payment_timeout())
                .expect("Invalid payment configuration"),
        ) as Arc<dyn PaymentGateway>
    });
    let object_store = config.object_storage.as_ref().map(|storage| {
        Arc::new(
            S3Store::new(storage, config.helper_timeout()).expect("Invalid object storage configuration"),
        ) as Arc<dyn ObjectStore>
    });

    let state = AppState::new(
        pool,
        config.clone(),
        vault,
        Backends {
            rate_limit_store,
            transports: build_transports(&config),
            payment_gateway,
            object_store,
            clock: Arc::new(SystemClock),
        },
    );

    let shutdown = CancellationToken::new();
    let scheduler = tokio::spawn(Scheduler::for_app(&state).run(shutdown.child_token()));

    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::new(
        config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        config.server_port,
    );
    tracing::info!("Server listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind"),
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await
    .expect("Failed to start server");

    shutdown.cancel();
    if let Err(err) = scheduler.await {
        tracing::warn!(error = %err, "scheduler task ended abnormally");
    }
}
