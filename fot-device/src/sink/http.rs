use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::BatchSink;
use crate::error::SinkError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// POSTs every batch as a JSON array.
#[derive(Debug, Clone)]
pub struct HttpJsonSink {
    client: reqwest::Client,
    url: String,
}

impl HttpJsonSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl<T> BatchSink<T> for HttpJsonSink
where
    T: Serialize + Send + Sync + 'static,
{
    async fn flush(&mut self, batch: &[T]) -> Result<(), SinkError> {
        self.client
            .post(&self.url)
            .timeout(REQUEST_TIMEOUT)
            .json(batch)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let mut sink = HttpJsonSink::new("http://127.0.0.1:9/api/latency-records/records");
        let err = BatchSink::<u32>::flush(&mut sink, &[1, 2]).await.unwrap_err();
        assert!(matches!(err, SinkError::Http(_)));
    }
}
