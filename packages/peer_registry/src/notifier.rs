use async_trait::async_trait;

use crate::types::Envelope;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Delivers inbound messages to the local frontend.
///
/// Called once per matched inbound frame. Failures are logged by the caller
/// and never retried.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, envelope: &Envelope) -> Result<(), BoxError>;
}
