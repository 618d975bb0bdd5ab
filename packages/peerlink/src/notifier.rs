//! Delivers inbound messages to the frontend over HTTP.

use async_trait::async_trait;
use peer_registry::{BoxError, Envelope, Notifier};
use tracing::debug;

use crate::config::FrontendConfig;

/// POSTs each envelope as JSON to the frontend's receive endpoint.
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(config: &FrontendConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            url: config.notify_url.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, envelope: &Envelope) -> Result<(), BoxError> {
        let resp = self.client.post(&self.url).json(envelope).send().await?;
        let status = resp.status();
        resp.error_for_status()?;
        debug!(
            url = %self.url,
            status = %status,
            sender = envelope.addressing.sender_db_id,
            receiver = envelope.addressing.receiver_db_id,
            "message delivered to frontend"
        );
        Ok(())
    }
}
