//! Settlement gateway clients
//!
//! The gateway's own signature formats are out of scope; the engine only
//! needs "create pending order" and "query status". [`HttpSettlementGateway`]
//! speaks a small JSON contract to an adapter service, and
//! [`ManualSettlementGateway`] is used when no adapter is configured, leaving
//! orders pending until a callback or an operator settles them.

use std::time::Duration;

use async_trait::async_trait;
use playmeter_core::{
    models::{GatewayOrder, GatewayStatus, RechargeOrder},
    traits::SettlementGateway,
    AppError, AppResult,
};
use reqwest::{Client, ClientBuilder};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, instrument};
use uuid::Uuid;

#[derive(Debug, Serialize)]
struct CreateOrderBody {
    order_id: Uuid,
    account_id: i64,
    amount: Decimal,
}

pub struct HttpSettlementGateway {
    http_client: Client,
    base_url: String,
}

impl HttpSettlementGateway {
    pub fn new(base_url: &str, timeout_ms: u64) -> AppResult<Self> {
        let http_client = ClientBuilder::new()
            .timeout(Duration::from_millis(timeout_ms))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| AppError::Settlement(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        what: &str,
    ) -> AppResult<T> {
        let status = response.status();
        if !status.is_success() {
            error!("Gateway HTTP error on {}: status={}", what, status);
            return Err(AppError::Settlement(format!(
                "{} failed with HTTP {}",
                what,
                status.as_u16()
            )));
        }

        response.json::<T>().await.map_err(|e| {
            error!("Failed to parse gateway response for {}: {}", what, e);
            AppError::Settlement(format!("Failed to parse {} response: {}", what, e))
        })
    }
}

fn transport_error(what: &str, e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Settlement(format!("{} timed out", what))
    } else {
        AppError::Settlement(format!("{} failed: {}", what, e))
    }
}

#[async_trait]
impl SettlementGateway for HttpSettlementGateway {
    #[instrument(skip(self))]
    async fn create_pending_order(
        &self,
        order_id: Uuid,
        account_id: i64,
        amount: Decimal,
    ) -> AppResult<GatewayOrder> {
        let response = self
            .http_client
            .post(format!("{}/orders", self.base_url))
            .json(&CreateOrderBody {
                order_id,
                account_id,
                amount,
            })
            .send()
            .await
            .map_err(|e| transport_error("create order", e))?;

        let order: GatewayOrder = Self::read_json(response, "create order").await?;
        debug!("Gateway created order {} as {}", order_id, order.reference);
        Ok(order)
    }

    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn query_status(&self, order: &RechargeOrder) -> AppResult<GatewayStatus> {
        let response = self
            .http_client
            .get(format!("{}/orders/{}", self.base_url, order.gateway_reference))
            .send()
            .await
            .map_err(|e| transport_error("query status", e))?;

        Self::read_json(response, "query status").await
    }
}

/// Gateway stand-in without a remote side
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualSettlementGateway;

#[async_trait]
impl SettlementGateway for ManualSettlementGateway {
    async fn create_pending_order(
        &self,
        order_id: Uuid,
        _account_id: i64,
        _amount: Decimal,
    ) -> AppResult<GatewayOrder> {
        Ok(GatewayOrder {
            reference: format!("manual-{}", order_id),
            checkout_url: None,
        })
    }

    async fn query_status(&self, _order: &RechargeOrder) -> AppResult<GatewayStatus> {
        Ok(GatewayStatus::Pending)
    }
}
