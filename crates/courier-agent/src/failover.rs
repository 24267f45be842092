use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use courier_core::DeltaSink;

use crate::error::AgentError;
use crate::provider::{Turn, TurnProvider, TurnRequest};

/// Primary-then-secondary transport pair. Any error from the primary turn
/// (except cancellation) triggers exactly one retry against the secondary.
pub struct FailoverProvider {
    primary: Box<dyn TurnProvider>,
    secondary: Box<dyn TurnProvider>,
}

impl FailoverProvider {
    pub fn new(primary: Box<dyn TurnProvider>, secondary: Box<dyn TurnProvider>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl TurnProvider for FailoverProvider {
    fn name(&self) -> &str {
        "failover"
    }

    async fn run_turn(
        &self,
        req: &TurnRequest,
        on_delta: Option<&DeltaSink>,
        cancel: &CancellationToken,
    ) -> Result<Turn, AgentError> {
        match self.primary.run_turn(req, on_delta, cancel).await {
            Ok(turn) => Ok(turn),
            Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
            Err(e) => {
                warn!(
                    primary = self.primary.name(),
                    secondary = self.secondary.name(),
                    error = %e,
                    "primary provider failed, trying secondary"
                );
                self.secondary.run_turn(req, on_delta, cancel).await
            }
        }
    }
}
