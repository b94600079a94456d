use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Client};
use serde::Serialize;
use uuid::Uuid;

use sacco_core::external::{Notice, Notifier, PaymentGateway};

use crate::contracts::StkPushCommand;

const NOTIFICATIONS_CHANNEL: &str = "notifications";
const STK_CHANNEL: &str = "payments.stk";

#[derive(Clone)]
pub struct RedisBus {
    client: Client,
}

impl RedisBus {
    pub fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn publish_json<T: Serialize>(&self, channel: &str, payload: &T) -> Result<()> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(payload)?;
        let _: i64 = connection.publish(channel, serialized).await?;
        Ok(())
    }
}

/// Fans notices out on the notifications channel; a delivery worker
/// picks them up and turns them into SMS or in-app messages.
#[derive(Clone)]
pub struct RedisNotifier {
    bus: RedisBus,
}

impl RedisNotifier {
    pub fn new(bus: RedisBus) -> Self {
        Self { bus }
    }
}

#[derive(Debug, Serialize)]
struct NoticeEnvelope<'a> {
    recipients: &'a [Uuid],
    #[serde(flatten)]
    notice: &'a Notice,
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn notify(&self, recipients: &[Uuid], notice: Notice) -> Result<()> {
        self.bus
            .publish_json(
                NOTIFICATIONS_CHANNEL,
                &NoticeEnvelope {
                    recipients,
                    notice: &notice,
                },
            )
            .await
    }
}

/// Queues STK push requests for the mobile-money worker. The returned
/// checkout reference is what the provider's callback will later quote.
#[derive(Clone)]
pub struct RedisStkGateway {
    bus: RedisBus,
}

impl RedisStkGateway {
    pub fn new(bus: RedisBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl PaymentGateway for RedisStkGateway {
    async fn initiate(
        &self,
        phone: &str,
        amount: rust_decimal::Decimal,
        account_reference: &str,
    ) -> Result<String> {
        let checkout_reference = format!("STK-{}", Uuid::new_v4().simple());
        self.bus
            .publish_json(
                STK_CHANNEL,
                &StkPushCommand {
                    checkout_reference: checkout_reference.clone(),
                    phone: phone.to_string(),
                    amount,
                    account_reference: account_reference.to_string(),
                    requested_at: Utc::now(),
                },
            )
            .await?;
        Ok(checkout_reference)
    }
}
