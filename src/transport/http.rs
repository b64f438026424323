//! HTTP implementations of the exchange and ping transports

use super::{ExchangeContext, PingClient, PingResponse, Transport, TransportError};
use crate::protocol::{ExchangePayload, ExchangeResponse};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("mgmt-broker/", env!("CARGO_PKG_VERSION"));

fn build_client(timeout: Duration) -> Result<Client, TransportError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| TransportError::Network(e.to_string()))
}

fn map_send_error(error: reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Network(error.to_string())
    }
}

/// Message exchange over HTTP POST with a JSON body
pub struct HttpTransport {
    url: String,
    timeout: Duration,
    client: Client,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            url: url.into(),
            timeout,
            client: build_client(timeout)?,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn exchange(
        &self,
        payload: &ExchangePayload,
        context: &ExchangeContext,
    ) -> Result<ExchangeResponse, TransportError> {
        let mut request = self.client.post(&self.url).json(payload);
        if let Some(ref secure_id) = context.secure_id {
            request = request.header("X-Computer-ID", secure_id);
        }

        debug!(
            url = %self.url,
            messages = payload.messages.len(),
            sequence = payload.sequence,
            "Sending exchange request"
        );

        let response = request
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<ExchangeResponse>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

/// Ping over HTTP POST with a form-encoded `insecure_id`
pub struct HttpPingClient {
    timeout: Duration,
    client: Client,
}

impl HttpPingClient {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            timeout,
            client: build_client(timeout)?,
        })
    }
}

#[async_trait]
impl PingClient for HttpPingClient {
    async fn ping(&self, url: &str, insecure_id: &str) -> Result<PingResponse, TransportError> {
        let response = self
            .client
            .post(url)
            .form(&[("insecure_id", insecure_id)])
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        // Older servers answer with an empty body
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        if body.trim().is_empty() {
            return Ok(PingResponse::default());
        }
        serde_json::from_str(&body).map_err(|e| TransportError::Decode(e.to_string()))
    }
}
