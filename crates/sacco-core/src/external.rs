use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Notification dispatched to members or administrators. Delivery is
/// best-effort; engines log failures and carry on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub kind: String,
    pub title: String,
    pub message: String,
    pub related_entity_type: Option<String>,
    pub related_entity_id: Option<Uuid>,
}

impl Notice {
    pub fn new(kind: &str, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            title: title.into(),
            message: message.into(),
            related_entity_type: None,
            related_entity_id: None,
        }
    }

    pub fn about(mut self, entity_type: &str, entity_id: Uuid) -> Self {
        self.related_entity_type = Some(entity_type.to_string());
        self.related_entity_id = Some(entity_id);
        self
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipients: &[Uuid], notice: Notice) -> anyhow::Result<()>;
}

/// Role and permission lookups live outside this core.
#[async_trait]
pub trait RoleDirectory: Send + Sync {
    async fn has_role(&self, user_id: Uuid, role: &str) -> anyhow::Result<bool>;
    async fn role_holders(&self, role: &str) -> anyhow::Result<Vec<Uuid>>;
}

/// Mobile-money collection. The wire protocol stays behind this seam;
/// `initiate` returns the gateway checkout reference the asynchronous
/// callback will later carry.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initiate(
        &self,
        phone: &str,
        amount: Decimal,
        account_reference: &str,
    ) -> anyhow::Result<String>;
}
