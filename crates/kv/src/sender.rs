use async_trait::async_trait;
use ranger_kvpb::{BatchRequest, BatchResponse, KvResult};

/// Anything that can serve a batch.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Send `batch` and wait for its response.
    async fn send(&self, batch: BatchRequest) -> KvResult<BatchResponse>;
}
