//! Playmeter server
//!
//! Authorization and billing engine for pay-per-use mixed-reality venues.
//! Wires storage, counters and the settlement gateway from configuration,
//! starts the background workers and serves the HTTP API.

use actix_cors::Cors;
use actix_web::{dev::Service, http::header, middleware, web, App, HttpResponse, HttpServer};
use anyhow::Context;
use playmeter_api::{configure_api, AppState};
use playmeter_auth::{JwtService, RawPath, TrustedProxies};
use playmeter_cache::Counters;
use playmeter_core::{
    config::{StorageBackend, SettlementConfig},
    policy::StaticPolicySource,
    traits::{PolicySource, SettlementGateway},
    AppConfig, Clock, EnginePolicy, SystemClock,
};
use playmeter_db::{create_pool, run_migrations, MemoryStore, PgPolicySource, Stores};
use playmeter_services::{
    workers, Engine, EngineDeps, EngineSettings, HttpSettlementGateway, ManualSettlementGateway,
    TracingAlertSink,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How often expired keys are evicted from the in-process counter store
const COUNTER_PURGE_SECS: u64 = 60;

/// Initialize tracing/logging
///
/// `LOG_FORMAT=json` switches to structured output for log shippers.
fn init_tracing() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "playmeter={lvl},playmeter_api={lvl},playmeter_services={lvl},playmeter_db={lvl},actix_web=info,sqlx=warn",
            lvl = log_level
        ))
    });

    let json = env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init();
    }
}

/// Durable stores plus the policy source that reads overrides from them
async fn build_stores(
    config: &AppConfig,
    base_policy: EnginePolicy,
) -> anyhow::Result<(Stores, Arc<dyn PolicySource>)> {
    match config.storage.backend {
        StorageBackend::Postgres => {
            info!("Connecting to database...");
            let pool = create_pool(&config.database.url, Some(config.database.max_connections))
                .await
                .context("failed to create database pool")?;
            if config.database.run_migrations {
                run_migrations(&pool)
                    .await
                    .context("failed to run database migrations")?;
            }
            info!(
                "Database connection established with {} max connections",
                config.database.max_connections
            );
            let policy_source = Arc::new(PgPolicySource::new(pool.clone(), base_policy));
            Ok((Stores::postgres(pool), policy_source))
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; all state is lost on restart");
            Ok((
                Stores::memory(Arc::new(MemoryStore::new())),
                Arc::new(StaticPolicySource::new(base_policy)),
            ))
        }
    }
}

fn build_gateway(settlement: &SettlementConfig) -> anyhow::Result<Arc<dyn SettlementGateway>> {
    if settlement.gateway_url.trim().is_empty() {
        warn!("No settlement gateway configured; recharges settle only through callbacks");
        return Ok(Arc::new(ManualSettlementGateway));
    }
    let gateway = HttpSettlementGateway::new(&settlement.gateway_url, settlement.request_timeout_ms)
        .context("failed to build settlement gateway client")?;
    info!("Settlement gateway at {}", settlement.gateway_url);
    Ok(Arc::new(gateway))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_tracing();

    info!("Starting Playmeter v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load().context("failed to load configuration")?;
    if config.auth.settlement_webhook_secret.is_empty() {
        warn!("Settlement webhook secret is empty; every callback will be rejected");
    }

    let jwt_service = Arc::new(JwtService::new(
        &config.auth.jwt_secret,
        config.auth.jwt_expiration_secs,
    ));
    info!(
        "JWT service configured with {} second token expiration",
        config.auth.jwt_expiration_secs
    );

    let (stores, policy_source) = build_stores(&config, EnginePolicy::from(&config)).await?;
    let storage_backend = match config.storage.backend {
        StorageBackend::Postgres => "postgres",
        StorageBackend::Memory => "memory",
    };

    let counters = Arc::new(
        Counters::connect(config.counters.backend, &config.redis.url)
            .await
            .context("failed to set up counter store")?,
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = Arc::new(Engine::new(
        EngineDeps {
            stores,
            counters: counters.store(),
            policy_source,
            gateway: build_gateway(&config.settlement)?,
            alerts: Arc::new(TracingAlertSink),
            jwt: jwt_service.clone(),
            clock: clock.clone(),
        },
        EngineSettings::from(&config),
    ));

    if !config.auth.bootstrap_admin_username.trim().is_empty() {
        engine
            .users
            .ensure_admin(
                &config.auth.bootstrap_admin_username,
                &config.auth.bootstrap_admin_password,
            )
            .await
            .context("failed to bootstrap admin user")?;
    }

    let mut background = vec![workers::spawn_settlement_poller(
        engine.settlement.clone(),
        Duration::from_secs(config.settlement.poll_interval_secs.max(1)),
    )];
    if let Counters::Memory(store) = counters.as_ref() {
        background.push(workers::spawn_counter_purger(
            store.clone(),
            engine.policy.clone(),
            clock.clone(),
            Duration::from_secs(COUNTER_PURGE_SECS),
        ));
    }
    if config.tier.scheduler_enabled {
        background.push(workers::spawn_tier_scheduler(engine.tiers.clone(), clock));
    } else {
        info!("Monthly tier scheduler disabled");
    }

    let state = web::Data::new(AppState::new(
        engine,
        config.auth.settlement_webhook_secret.clone(),
        storage_backend,
        counters,
    ));
    let jwt_data = web::Data::new(jwt_service);
    let trusted_proxies = web::Data::new(
        TrustedProxies::parse(&config.security.trusted_proxies)
            .context("invalid security.trusted_proxies")?,
    );
    if !trusted_proxies.is_empty() {
        info!("Honouring X-Forwarded-For from {:?}", trusted_proxies.get_ref());
    }
    let cors_origins = config.server.cors_origins.clone();
    let bind_addr = config.server_addr();
    info!(
        "Starting HTTP server on {} with {} workers",
        bind_addr, config.server.workers
    );

    let result = HttpServer::new(move || {
        let cors_origins_inner = cors_origins.clone();
        let cors = Cors::default()
            .allowed_origin_fn(move |origin, _req_head| {
                origin.to_str().is_ok_and(|origin_str| {
                    cors_origins_inner
                        .split(',')
                        .any(|allowed| allowed.trim() == origin_str)
                })
            })
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
            .allowed_headers(vec![
                header::AUTHORIZATION,
                header::ACCEPT,
                header::CONTENT_TYPE,
                header::COOKIE,
            ])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .app_data(state.clone())
            .app_data(jwt_data.clone())
            .app_data(trusted_proxies.clone())
            .app_data(web::PayloadConfig::new(1024 * 1024))
            .app_data(web::JsonConfig::default().limit(256 * 1024))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::NormalizePath::trim())
            .wrap_fn(|req, srv| {
                RawPath::capture(&req);
                srv.call(req)
            })
            .configure(configure_api)
            .route(
                "/",
                web::get().to(|| async {
                    HttpResponse::Found()
                        .append_header(("Location", "/api/v1/health"))
                        .finish()
                }),
            )
    })
    .workers(config.server.workers)
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {}", bind_addr))?
    .run()
    .await;

    for handle in background {
        handle.abort();
    }
    info!("Playmeter stopped");
    result.context("HTTP server error")
}
