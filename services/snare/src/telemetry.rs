//! Telemetry records and sinks.
//!
//! The dispatcher emits one [`ConnRecord`] per tracked connection before the
//! handler runs; handlers may emit more records carrying captured payload.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use snare_id::Identity;
use thiserror::Error;
use tracing::debug;

use crate::conn::ConnMetadata;

/// Timeout for a single telemetry request.
pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors reported by telemetry sinks.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The record could not be delivered.
    #[error("telemetry delivery failed: {0}")]
    Delivery(String),

    /// The sink answered with a non-success status.
    #[error("telemetry sink rejected record with status {status}")]
    Rejected { status: u16 },
}

impl From<reqwest::Error> for TelemetryError {
    fn from(err: reqwest::Error) -> Self {
        TelemetryError::Delivery(err.to_string())
    }
}

/// A structured record describing one connection event.
#[derive(Debug, Clone, Serialize)]
pub struct ConnRecord {
    pub sensor_id: Identity,
    pub timestamp: DateTime<Utc>,
    pub src_ip: String,
    pub src_port: u16,
    pub dest_port: u16,
    /// Index of the matched rule in the rule file.
    pub rule: usize,
    pub handler: String,
    /// Captured payload, base64-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl ConnRecord {
    pub fn new(
        sensor_id: Identity,
        peer: SocketAddr,
        metadata: &ConnMetadata,
        handler: &str,
        payload: Option<&[u8]>,
    ) -> Self {
        Self {
            sensor_id,
            timestamp: Utc::now(),
            src_ip: peer.ip().to_string(),
            src_port: peer.port(),
            dest_port: metadata.target_port,
            rule: metadata.rule.index,
            handler: handler.to_string(),
            payload: payload
                .filter(|p| !p.is_empty())
                .map(|p| base64::engine::general_purpose::STANDARD.encode(p)),
        }
    }
}

/// Destination for connection records.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn log(&self, record: &ConnRecord) -> Result<(), TelemetryError>;
}

/// Sink that POSTs records as JSON to an HTTP collector.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: impl Into<String>) -> Result<Self, TelemetryError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_SINK_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl TelemetrySink for HttpSink {
    async fn log(&self, record: &ConnRecord) -> Result<(), TelemetryError> {
        let response = self.client.post(&self.url).json(record).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TelemetryError::Rejected {
                status: status.as_u16(),
            });
        }

        debug!(
            handler = %record.handler,
            src_ip = %record.src_ip,
            dest_port = record.dest_port,
            "Telemetry record delivered"
        );
        Ok(())
    }
}
