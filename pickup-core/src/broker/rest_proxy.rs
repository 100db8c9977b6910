//! Producer for a Kafka REST proxy (v2 JSON API).

use super::{BrokerError, Producer};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

const CONTENT_TYPE: &str = "application/vnd.kafka.json.v2+json";
pub(super) const API_CONTENT_TYPE: &str = "application/vnd.kafka.v2+json";

/// Publishes each payload as one JSON record to `POST {base}/topics/{topic}`.
pub struct RestProxyProducer {
    client: reqwest::Client,
    endpoint: Url,
}

#[derive(Debug, Deserialize)]
struct ProduceResponse {
    #[serde(default)]
    offsets: Vec<RecordOffset>,
}

#[derive(Debug, Deserialize)]
struct RecordOffset {
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

impl RestProxyProducer {
    pub fn new(base_url: &Url, topic: &str, timeout: Duration) -> Result<Self, BrokerError> {
        let endpoint = Url::parse(&format!(
            "{}/topics/{}",
            base_url.as_str().trim_end_matches('/'),
            topic
        ))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn publish(&self, payload: &[u8]) -> Result<(), BrokerError> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;
        let body = serde_json::json!({ "records": [{ "value": value }] });

        let response = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .header(reqwest::header::ACCEPT, API_CONTENT_TYPE)
            .body(body.to_string())
            .send()
            .await?;

        check_offsets(&read_body(response).await?)
    }
}

/// Body of a successful response. A failure reading the body is a
/// transport error, not a payload error.
pub(super) async fn read_body(response: reqwest::Response) -> Result<String, BrokerError> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(BrokerError::Rejected {
            status: status.as_u16(),
            body: text,
        });
    }
    Ok(text)
}

/// A 200 response can still carry per-record failures.
fn check_offsets(body: &str) -> Result<(), BrokerError> {
    let response: ProduceResponse = serde_json::from_str(body)?;
    match response.offsets.into_iter().find(|o| o.error_code.is_some()) {
        Some(RecordOffset {
            error_code: Some(code),
            error,
        }) => Err(BrokerError::RecordRejected {
            code,
            message: error.unwrap_or_default(),
        }),
        _ => Ok(()),
    }
}

#[async_trait]
impl Producer for RestProxyProducer {
    async fn send(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<(), BrokerError> {
        if cancel.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BrokerError::Cancelled),
            result = self.publish(payload) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn producer(base: &str) -> RestProxyProducer {
        RestProxyProducer::new(
            &Url::parse(base).unwrap(),
            "order-events",
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(
            producer("http://proxy:8082").endpoint().as_str(),
            "http://proxy:8082/topics/order-events"
        );
        assert_eq!(
            producer("http://proxy:8082/kafka/").endpoint().as_str(),
            "http://proxy:8082/kafka/topics/order-events"
        );
    }

    #[test]
    fn test_record_errors_are_failures() {
        let ok = r#"{"key_schema_id":null,"value_schema_id":null,
            "offsets":[{"partition":2,"offset":100,"error_code":null,"error":null}]}"#;
        assert!(check_offsets(ok).is_ok());

        let rejected = r#"{"offsets":[{"partition":null,"offset":null,
            "error_code":50002,"error":"Kafka error: leader not available"}]}"#;
        let err = check_offsets(rejected).unwrap_err();
        assert!(matches!(err, BrokerError::RecordRejected { code: 50002, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_send_does_no_io() {
        // nothing listens on this port; a real request would fail differently
        let producer = producer("http://127.0.0.1:9");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = producer.send(&cancel, b"{}").await.unwrap_err();
        assert!(matches!(err, BrokerError::Cancelled));
    }

    #[tokio::test]
    async fn test_truncated_body_is_a_request_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            // promises 64 bytes, sends 11, then hangs up
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 64\r\n\r\n{\"offsets\":")
                .await
                .unwrap();
        });

        let err = producer(&format!("http://{addr}"))
            .send(&CancellationToken::new(), b"{}")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Request(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_non_json_payload_is_rejected() {
        let producer = producer("http://127.0.0.1:9");
        let err = producer
            .send(&CancellationToken::new(), b"not json")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidPayload(_)));
    }
}
