use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

/// One charge attempt as handed to the processor.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub payment_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    /// Stable `payment:attempt` reference forwarded for processor-side
    /// idempotency.
    pub reference: String,
    pub payment_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChargeResponse {
    pub success: bool,
    /// Processor decline code; classification normalizes it, the engine
    /// never branches on raw values anywhere else.
    pub error_code: Option<String>,
    /// Raw response body, persisted verbatim on the payment row.
    pub raw: Value,
}

/// key: payment-adapter -> processor integration
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn charge(&self, request: ChargeRequest) -> Result<ChargeResponse>;
}

/// key: inventory-adapter -> fulfillment checks
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn can_fulfill(&self, product_id: Uuid, quantity: i32) -> Result<bool>;
    async fn release(&self, order_id: Uuid) -> Result<()>;
}

/// key: notification-adapter -> customer-facing events
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn emit(&self, event: &str, context: Value) -> Result<()>;
}

/// key: payment-adapter-stub -> settles every charge
pub struct AlwaysSettleProcessor;

#[async_trait]
impl PaymentProcessor for AlwaysSettleProcessor {
    async fn charge(&self, request: ChargeRequest) -> Result<ChargeResponse> {
        Ok(ChargeResponse {
            success: true,
            error_code: None,
            raw: serde_json::json!({
                "reference": request.reference,
                "amount_cents": request.amount_cents,
                "currency": request.currency,
                "integration": "stubbed",
            }),
        })
    }
}

/// key: inventory-adapter-stub -> never runs out of stock
pub struct UnlimitedInventory;

#[async_trait]
impl Inventory for UnlimitedInventory {
    async fn can_fulfill(&self, _product_id: Uuid, _quantity: i32) -> Result<bool> {
        Ok(true)
    }

    async fn release(&self, _order_id: Uuid) -> Result<()> {
        Ok(())
    }
}

/// Logs events instead of delivering them anywhere.
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn emit(&self, event: &str, context: Value) -> Result<()> {
        info!(event, %context, "notification emitted");
        Ok(())
    }
}

/// External collaborators handed to the orchestrator and schedulers.
#[derive(Clone)]
pub struct Collaborators {
    pub processor: Arc<dyn PaymentProcessor>,
    pub inventory: Arc<dyn Inventory>,
    pub notifier: Arc<dyn NotificationSink>,
}

impl Collaborators {
    /// Stubbed set used by the daemon until real integrations are wired in.
    pub fn stubbed() -> Self {
        Self {
            processor: Arc::new(AlwaysSettleProcessor),
            inventory: Arc::new(UnlimitedInventory),
            notifier: Arc::new(LogNotifier),
        }
    }
}
