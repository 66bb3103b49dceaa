//! Application configuration
//!
//! This module provides centralized configuration management using the `config` crate.
//! Configuration can be loaded from environment variables and config files.

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;

/// Main application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub counters: CounterConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub tier: TierConfig,
}

/// HTTP server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Allowed CORS origins, comma separated
    #[serde(default = "default_cors_origins")]
    pub cors_origins: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_cors_origins() -> String {
    "http://localhost:3000".to_string()
}

/// Database configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Run embedded migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

fn default_max_connections() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            run_migrations: true,
        }
    }
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default)]
    pub url: String,
}

/// Durable store backend
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// PostgreSQL (production)
    #[default]
    Postgres,
    /// In-process store (single instance, development)
    Memory,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
}

/// Backend for the expiring counters (nonces, rate limits, anomaly windows)
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CounterBackend {
    /// In-process map, valid for single-instance deployments only
    #[default]
    Memory,
    /// Shared Redis, required when running several instances
    Redis,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CounterConfig {
    #[serde(default)]
    pub backend: CounterBackend,
}

/// Portal authentication configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// JWT signing secret
    pub jwt_secret: String,

    /// JWT token expiration in seconds
    #[serde(default = "default_jwt_expiration")]
    pub jwt_expiration_secs: i64,

    /// Shared secret the settlement gateway presents on callbacks
    #[serde(default)]
    pub settlement_webhook_secret: String,

    /// Admin created on startup when no user of that name exists
    #[serde(default)]
    pub bootstrap_admin_username: String,

    #[serde(default)]
    pub bootstrap_admin_password: String,
}

fn default_jwt_expiration() -> i64 {
    1800
}

/// Request security defaults (replay, rate limit, anomaly)
#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    #[serde(default = "default_replay_window")]
    pub replay_window_secs: i64,

    #[serde(default = "default_account_rate_limit")]
    pub account_requests_per_window: u64,

    #[serde(default = "default_address_rate_limit")]
    pub address_requests_per_window: u64,

    #[serde(default = "default_rate_window")]
    pub rate_window_secs: i64,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,

    #[serde(default = "default_failure_window")]
    pub failure_window_secs: i64,

    #[serde(default = "default_distinct_threshold")]
    pub distinct_account_threshold: u64,

    #[serde(default = "default_distinct_window")]
    pub distinct_account_window_secs: i64,

    /// Optional per-tier override of the per-account limit
    #[serde(default)]
    pub silver_requests_per_window: Option<u64>,

    #[serde(default)]
    pub gold_requests_per_window: Option<u64>,

    /// Comma separated proxy IPs whose `X-Forwarded-For` is believed.
    /// Empty means the socket peer is always the source address.
    #[serde(default)]
    pub trusted_proxies: String,
}

fn default_replay_window() -> i64 {
    300
}

fn default_account_rate_limit() -> u64 {
    10
}

fn default_address_rate_limit() -> u64 {
    100
}

fn default_rate_window() -> i64 {
    60
}

fn default_failure_threshold() -> u64 {
    20
}

fn default_failure_window() -> i64 {
    300
}

fn default_distinct_threshold() -> u64 {
    5
}

fn default_distinct_window() -> i64 {
    60
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            replay_window_secs: default_replay_window(),
            account_requests_per_window: default_account_rate_limit(),
            address_requests_per_window: default_address_rate_limit(),
            rate_window_secs: default_rate_window(),
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window(),
            distinct_account_threshold: default_distinct_threshold(),
            distinct_account_window_secs: default_distinct_window(),
            silver_requests_per_window: None,
            gold_requests_per_window: None,
            trusted_proxies: String::new(),
        }
    }
}

/// Billing-specific configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BillingConfig {
    /// Window in which an identical business key replays the original result
    #[serde(default = "default_idempotency_window")]
    pub idempotency_window_secs: i64,

    /// Bounded wait for the per-account balance lock
    #[serde(default = "default_lock_wait")]
    pub account_lock_wait_ms: u64,

    /// TTL of the in-process catalog and credential caches
    #[serde(default = "default_lookup_cache_ttl")]
    pub lookup_cache_ttl_secs: u64,

    /// TTL of the cached policy snapshot
    #[serde(default = "default_policy_cache_ttl")]
    pub policy_cache_ttl_secs: u64,
}

fn default_idempotency_window() -> i64 {
    30
}

fn default_lock_wait() -> u64 {
    2000
}

fn default_lookup_cache_ttl() -> u64 {
    30
}

fn default_policy_cache_ttl() -> u64 {
    30
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            idempotency_window_secs: default_idempotency_window(),
            account_lock_wait_ms: default_lock_wait(),
            lookup_cache_ttl_secs: default_lookup_cache_ttl(),
            policy_cache_ttl_secs: default_policy_cache_ttl(),
        }
    }
}

/// External settlement gateway configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SettlementConfig {
    /// Base URL of the settlement gateway; empty disables the HTTP gateway
    #[serde(default)]
    pub gateway_url: String,

    /// Time to wait for a confirmation callback before polling
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: i64,

    /// Consecutive polling failures before an order is disputed
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: i32,

    /// Interval of the background polling sweep
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// HTTP timeout for gateway calls
    #[serde(default = "default_gateway_timeout")]
    pub request_timeout_ms: u64,
}

fn default_confirmation_timeout() -> i64 {
    300
}

fn default_max_poll_failures() -> i32 {
    3
}

fn default_poll_interval() -> u64 {
    30
}

fn default_gateway_timeout() -> u64 {
    5000
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            gateway_url: String::new(),
            confirmation_timeout_secs: default_confirmation_timeout(),
            max_poll_failures: default_max_poll_failures(),
            poll_interval_secs: default_poll_interval(),
            request_timeout_ms: default_gateway_timeout(),
        }
    }
}

/// Spend-based tier thresholds
#[derive(Debug, Deserialize, Clone)]
pub struct TierConfig {
    /// Trailing-month spend at or above which an account is `silver`
    #[serde(default = "default_silver_threshold")]
    pub silver_threshold: Decimal,

    /// Trailing-month spend at or above which an account is `gold`
    #[serde(default = "default_gold_threshold")]
    pub gold_threshold: Decimal,

    /// Run the monthly scheduler in this instance
    #[serde(default = "default_true")]
    pub scheduler_enabled: bool,
}

fn default_silver_threshold() -> Decimal {
    Decimal::new(500000, 2)
}

fn default_gold_threshold() -> Decimal {
    Decimal::new(2000000, 2)
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            silver_threshold: default_silver_threshold(),
            gold_threshold: default_gold_threshold(),
            scheduler_enabled: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and optional config file
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.workers", num_cpus::get() as i64)?
            .set_default("auth.jwt_expiration_secs", 1800)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("PLAYMETER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("PLAYMETER").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Get the server bind address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
