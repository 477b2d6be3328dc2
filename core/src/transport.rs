/// Seam to the socket transport, which lives outside this crate
use crate::error::{ChatError, Result};
use crate::protocol::{HistoryRequest, HistoryResponse, OutboundFrame};
use async_trait::async_trait;
use tracing::debug;

/// Send side of the connection, implemented by the transport adapter.
///
/// Inbound frames do not go through this trait: the adapter's reader pushes
/// raw frames into the channel consumed by `ChatSession::run_inbound`.
/// Timeouts are the adapter's concern and surface as `TransportUnavailable`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand one frame to the server
    async fn send(&self, frame: OutboundFrame) -> Result<()>;

    /// Round-trip one history request
    async fn request_history(&self, request: HistoryRequest) -> Result<HistoryResponse>;

    fn is_connected(&self) -> bool {
        true
    }
}

/// Transport with no connection behind it; every call fails
#[derive(Debug, Clone, Default)]
pub struct OfflineTransport;

#[async_trait]
impl Transport for OfflineTransport {
    async fn send(&self, frame: OutboundFrame) -> Result<()> {
        debug!("Offline: dropping outbound frame {}", frame.client_id());
        Err(ChatError::TransportUnavailable("not connected".to_string()))
    }

    async fn request_history(&self, request: HistoryRequest) -> Result<HistoryResponse> {
        debug!("Offline: cannot fetch history for {}", request.target_id);
        Err(ChatError::TransportUnavailable("not connected".to_string()))
    }

    fn is_connected(&self) -> bool {
        false
    }
}
