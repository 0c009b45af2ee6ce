use crate::certs::CertificateStore;
use crate::enrollment::EnrollmentApi;
use crate::error::{EnrollmentError, TransportError};
use crate::descriptor::{parse_sensors_json, RawDescriptor};
use crate::packager::OutboundBatch;
use crate::reload::RemoteSensorConfig;
use crate::sender::BatchTransport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Certificate, Client, Identity, StatusCode};
use serde::Deserialize;
use std::sync::RwLock;
use std::time::Duration;
use url::Url;

const ENROLL_CSR_PATH: &str = "enroll/csr";
const ENROLL_CERT_PATH: &str = "enroll/certificate";
const BATCHES_PATH: &str = "data/batches";
const TIME_PATH: &str = "time";
const AGENT_CONFIG_PATH: &str = "agent_config";

/// Maps a non-success status onto the transport taxonomy.
pub fn classify_status(status: StatusCode) -> TransportError {
    match status.as_u16() {
        401 | 403 | 495 | 496 => TransportError::CertificateRejected(status.as_u16()),
        429 => TransportError::Server(429),
        code if status.is_server_error() => TransportError::Server(code),
        code => TransportError::Client(code),
    }
}

/// HTTPS client that trusts only the pinned CA and, when built with an
/// identity, presents the agent certificate.
#[derive(Clone)]
pub struct SecureChannel {
    base: Url,
    client: Client,
}

impl SecureChannel {
    pub fn anonymous(base: &Url, ca_pem: &[u8], timeout: Duration) -> Result<Self, TransportError> {
        Self::build(base, ca_pem, None, timeout)
    }

    pub fn authenticated(
        base: &Url,
        ca_pem: &[u8],
        identity_pem: &[u8],
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        Self::build(base, ca_pem, Some(identity_pem), timeout)
    }

    fn build(
        base: &Url,
        ca_pem: &[u8],
        identity_pem: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let ca = Certificate::from_pem(ca_pem).map_err(|err| TransportError::Tls(err.to_string()))?;
        let mut builder = Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca)
            .https_only(true)
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .user_agent(concat!("probe-agent/", env!("CARGO_PKG_VERSION")));
        if let Some(pem) = identity_pem {
            let identity = Identity::from_pem(pem).map_err(|err| TransportError::Tls(err.to_string()))?;
            builder = builder.identity(identity);
        }
        let client = builder
            .build()
            .map_err(|err| TransportError::Tls(err.to_string()))?;
        Ok(Self {
            base: with_trailing_slash(base),
            client,
        })
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path)
            .map_err(|err| TransportError::Protocol(format!("bad endpoint {path}: {err}")))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn with_trailing_slash(url: &Url) -> Url {
    let mut url = url.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Enrollment endpoints over a channel without client identity.
pub struct HttpEnrollmentApi {
    channel: SecureChannel,
    agent_id: String,
}

impl HttpEnrollmentApi {
    pub fn new(channel: SecureChannel, agent_id: &str) -> Self {
        Self {
            channel,
            agent_id: agent_id.to_string(),
        }
    }

    /// Server wall clock, used for the startup skew check.
    pub async fn server_time(&self) -> Result<DateTime<Utc>, TransportError> {
        #[derive(Deserialize)]
        struct TimeResponse {
            timestamp: i64,
        }
        let response = self
            .channel
            .client()
            .get(self.channel.endpoint(TIME_PATH)?)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(classify_status(response.status()));
        }
        let body: TimeResponse = response.json().await?;
        DateTime::from_timestamp_millis(body.timestamp)
            .ok_or_else(|| TransportError::Protocol(format!("bad timestamp {}", body.timestamp)))
    }
}

fn enrollment_error(err: TransportError) -> EnrollmentError {
    match err {
        TransportError::Client(code) | TransportError::CertificateRejected(code) => {
            EnrollmentError::Rejected(format!("status {code}"))
        }
        other => EnrollmentError::Network(other.to_string()),
    }
}

#[async_trait]
impl EnrollmentApi for HttpEnrollmentApi {
    async fn submit_csr(&self, csr_pem: &str) -> Result<(), EnrollmentError> {
        let url = self.channel.endpoint(ENROLL_CSR_PATH).map_err(enrollment_error)?;
        let response = self
            .channel
            .client()
            .post(url)
            .query(&[("agent_id", self.agent_id.as_str())])
            .header(CONTENT_TYPE, "application/pkcs10")
            .body(csr_pem.to_string())
            .send()
            .await
            .map_err(|err| enrollment_error(err.into()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        tracing::debug!(status = status.as_u16(), detail = %detail, "signing request refused");
        Err(enrollment_error(classify_status(status)))
    }

    async fn fetch_certificate(&self) -> Result<String, EnrollmentError> {
        let url = self.channel.endpoint(ENROLL_CERT_PATH).map_err(enrollment_error)?;
        let response = self
            .channel
            .client()
            .get(url)
            .query(&[("agent_id", self.agent_id.as_str())])
            .send()
            .await
            .map_err(|err| enrollment_error(err.into()))?;
        match response.status() {
            StatusCode::OK => {
                let pem = response
                    .text()
                    .await
                    .map_err(|err| EnrollmentError::Network(err.to_string()))?;
                if pem.contains("BEGIN CERTIFICATE") {
                    Ok(pem)
                } else {
                    Err(EnrollmentError::Network("certificate response is not PEM".to_string()))
                }
            }
            StatusCode::ACCEPTED | StatusCode::NOT_FOUND => Err(EnrollmentError::Pending),
            StatusCode::GONE => Err(EnrollmentError::Revoked),
            status => Err(enrollment_error(classify_status(status))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BatchAck {
    accepted_seq: u64,
}

/// Batch delivery over a channel presenting the agent certificate. The
/// channel is rebuilt from the certificate store on `reconnect`.
pub struct HttpBatchTransport {
    base: Url,
    ca_pem: Vec<u8>,
    agent_id: String,
    timeout: Duration,
    store: CertificateStore,
    channel: RwLock<Option<SecureChannel>>,
}

impl HttpBatchTransport {
    pub fn new(base: &Url, ca_pem: Vec<u8>, agent_id: &str, store: CertificateStore, timeout: Duration) -> Self {
        Self {
            base: base.clone(),
            ca_pem,
            agent_id: agent_id.to_string(),
            timeout,
            store,
            channel: RwLock::new(None),
        }
    }

    fn current(&self) -> Result<SecureChannel, TransportError> {
        self.channel
            .read()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| TransportError::Tls("no client identity loaded".to_string()))
    }
}

#[async_trait]
impl BatchTransport for HttpBatchTransport {
    async fn reconnect(&self) -> Result<(), TransportError> {
        let identity = self
            .store
            .identity_pem()
            .map_err(|err| TransportError::Tls(err.to_string()))?;
        let channel = SecureChannel::authenticated(&self.base, &self.ca_pem, &identity, self.timeout)?;
        if let Ok(mut guard) = self.channel.write() {
            *guard = Some(channel);
        }
        tracing::info!("data channel rebuilt with current client certificate");
        Ok(())
    }

    async fn send(&self, batch: &OutboundBatch) -> Result<u64, TransportError> {
        let channel = self.current()?;
        let response = channel
            .client()
            .post(channel.endpoint(BATCHES_PATH)?)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .header("X-Agent-Id", &self.agent_id)
            .header("X-Batch-Seq", batch.seq.to_string())
            .body(batch.payload.clone())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }
        let ack: BatchAck = response
            .json()
            .await
            .map_err(|err| TransportError::Protocol(format!("bad acknowledgement: {err}")))?;
        Ok(ack.accepted_seq)
    }
}

#[async_trait]
impl RemoteSensorConfig for HttpBatchTransport {
    async fn fetch_sensors(&self) -> Result<Option<Vec<RawDescriptor>>, TransportError> {
        let channel = self.current()?;
        let response = channel
            .client()
            .get(channel.endpoint(AGENT_CONFIG_PATH)?)
            .query(&[("agent_id", &self.agent_id)])
            .send()
            .await?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response.text().await?;
                parse_sensors_json(&body)
                    .map(Some)
                    .map_err(|err| TransportError::Protocol(format!("bad sensor set: {err}")))
            }
            status => Err(classify_status(status)),
        }
    }
}
