use async_trait::async_trait;
use tracing::{info, warn};

use super::{ApprovalPrompt, Messenger};

/// Development adapter: approval prompts go to the log and nobody ever
/// answers, so ASK requests resolve by timeout. Useful for exercising a
/// policy before a real messenger is wired up.
pub struct LogMessenger;

impl LogMessenger {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogMessenger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Messenger for LogMessenger {
    async fn request_approval(&self, prompt: ApprovalPrompt) -> anyhow::Result<()> {
        warn!(
            request_id = %prompt.request_id,
            signature = %prompt.signature,
            expires_at = %prompt.expires_at,
            "approval required (log messenger cannot answer; request will time out)"
        );
        Ok(())
    }

    async fn notify_expired(&self, request_id: &str) {
        info!(request_id, "approval request expired");
    }

    async fn health_check(&self) -> bool {
        true
    }
}
