//! Notification transports.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use comply_core::defaults::GATEWAY_TIMEOUT_SECS;
use comply_core::{
    new_v7, Channel, DeliveryReceipt, Error, JobError, NotificationProvider, RenderedMessage,
    Result,
};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex>` of the request body when a secret is set.
pub const SIGNATURE_HEADER: &str = "X-Comply-Signature";

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    id: Option<String>,
}

/// Posts rendered messages as JSON to an email/SMS gateway.
pub struct HttpNotificationProvider {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl HttpNotificationProvider {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(GATEWAY_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            secret: None,
        })
    }

    /// Sign request bodies with HMAC-SHA256.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Gateway from `NOTIFICATION_GATEWAY_URL` and
    /// `NOTIFICATION_GATEWAY_SECRET`; `None` when no URL is configured.
    pub fn from_env() -> Result<Option<Self>> {
        let Ok(url) = std::env::var("NOTIFICATION_GATEWAY_URL") else {
            return Ok(None);
        };
        if url.trim().is_empty() {
            return Ok(None);
        }
        let mut provider = Self::new(url)?;
        if let Ok(secret) = std::env::var("NOTIFICATION_GATEWAY_SECRET") {
            if !secret.is_empty() {
                provider = provider.with_secret(secret);
            }
        }
        Ok(Some(provider))
    }

    fn sign(&self, body: &str) -> Result<Option<String>> {
        let Some(secret) = &self.secret else {
            return Ok(None);
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| Error::Config(format!("invalid gateway secret: {e}")))?;
        mac.update(body.as_bytes());
        Ok(Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes()))))
    }
}

#[async_trait]
impl NotificationProvider for HttpNotificationProvider {
    fn name(&self) -> &str {
        "http-gateway"
    }

    async fn send(&self, message: &RenderedMessage) -> std::result::Result<DeliveryReceipt, JobError> {
        let body = serde_json::to_string(message)?;
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json");
        if let Some(signature) = self.sign(&body)? {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(JobError::Http {
                status: status.as_u16(),
                message: text.chars().take(200).collect(),
            });
        }

        let provider_id = serde_json::from_str::<GatewayResponse>(&text)
            .ok()
            .and_then(|r| r.id)
            .unwrap_or_else(|| new_v7().to_string());
        debug!(
            subsystem = "notifications",
            component = "provider",
            channel = %message.channel(),
            provider_id = %provider_id,
            "Gateway accepted message"
        );
        Ok(DeliveryReceipt { provider_id })
    }
}

/// In-app delivery: the stored record is the message, so there is no transport.
#[derive(Debug, Default)]
pub struct InAppProvider;

#[async_trait]
impl NotificationProvider for InAppProvider {
    fn name(&self) -> &str {
        "in-app"
    }

    async fn send(&self, _message: &RenderedMessage) -> std::result::Result<DeliveryReceipt, JobError> {
        Ok(DeliveryReceipt {
            provider_id: format!("in-app:{}", new_v7()),
        })
    }
}

/// Providers routed by channel.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: HashMap<Channel, Arc<dyn NotificationProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, channel: Channel, provider: Arc<dyn NotificationProvider>) -> Self {
        self.providers.insert(channel, provider);
        self
    }

    /// In-app always; email and SMS through `gateway` when one is configured.
    pub fn standard(gateway: Option<Arc<dyn NotificationProvider>>) -> Self {
        let mut set = Self::new().with(Channel::InApp, Arc::new(InAppProvider));
        if let Some(gateway) = gateway {
            set = set
                .with(Channel::Email, gateway.clone())
                .with(Channel::Sms, gateway);
        }
        set
    }

    pub fn get(&self, channel: Channel) -> Option<&Arc<dyn NotificationProvider>> {
        self.providers.get(&channel)
    }

    pub async fn send(&self, message: &RenderedMessage) -> std::result::Result<DeliveryReceipt, JobError> {
        let channel = message.channel();
        let provider = self.get(channel).ok_or_else(|| {
            JobError::Rejected(format!("no provider configured for channel {channel}"))
        })?;
        provider.send(message).await
    }
}
