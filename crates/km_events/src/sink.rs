use std::sync::Arc;

use async_trait::async_trait;
use km_api::{ApiClient, ApiError};

use crate::{batch::EventBatch, pipeline::BatchSink};

/// Publishes batches to `POST /api/events/batch` through the shared HTTP
/// client; retry behavior comes from the client's policy.
pub struct HttpBatchSink {
    client: Arc<ApiClient>,
}

impl HttpBatchSink {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BatchSink for HttpBatchSink {
    async fn publish(&self, batch: &EventBatch) -> Result<(), ApiError> {
        self.client
            .post_accepted("/api/events/batch", km_api::SCOPE_GENERAL, batch)
            .await
    }
}
