use crate::engine::EngineError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Failure of one signaling operation
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Media router not ready")]
    NotReady,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Delegate(EngineError),

    #[error("Media engine timed out during {0}")]
    Timeout(&'static str),

    #[error("Fatal media engine failure: {0}")]
    Fatal(String),
}

impl From<EngineError> for SignalError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::WorkerDied(_) => SignalError::Fatal(e.to_string()),
            other => SignalError::Delegate(other),
        }
    }
}

impl SignalError {
    /// Reason string put into the `error` event
    pub fn client_message(&self) -> String {
        self.to_string()
    }

    /// Expected negotiation outcomes, as opposed to faults
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            SignalError::ProtocolViolation(_)
                | SignalError::CapabilityMismatch(_)
                | SignalError::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SignalError>;

/// Awaits an engine call, giving up after `limit`
pub async fn bounded<T, F>(operation: &'static str, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, EngineError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(SignalError::from),
        Err(_) => {
            tracing::error!("Engine call {} exceeded {:?}", operation, limit);
            Err(SignalError::Timeout(operation))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::{ProducerId, WorkerId};

    #[tokio::test]
    async fn test_bounded_maps_timeout() {
        let result: Result<()> = bounded("connect", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(SignalError::Timeout("connect"))));
    }

    #[tokio::test]
    async fn test_bounded_passes_engine_errors() {
        let result: Result<()> = bounded("connect", Duration::from_secs(1), async {
            Err(EngineError::AlreadyConnected)
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, SignalError::Delegate(EngineError::AlreadyConnected)));
        assert_eq!(err.client_message(), "Transport already connected");
    }

    #[test]
    fn test_worker_death_is_fatal() {
        let err = SignalError::from(EngineError::WorkerDied(WorkerId::new()));
        assert!(matches!(err, SignalError::Fatal(_)));
        assert!(!err.is_expected());
    }

    #[test]
    fn test_client_message_hides_identifiers() {
        let id = ProducerId::new();
        let err = SignalError::from(EngineError::ProducerNotFound(id));
        assert!(!err.client_message().contains(&id.to_string()));
    }
}
