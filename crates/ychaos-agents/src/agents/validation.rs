//! Certificate validation agents: probe TLS endpoints or local certificate
//! files and record expiry observations as monitoring datapoints. These
//! agents change nothing on the host; their value is the collected data.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use serde::{Deserialize, Serialize};
use tokio_rustls::TlsConnector;
use url::Url;
use x509_parser::prelude::FromDer;

use crate::agent::{
    Agent, AgentError, AgentLifecycle, AgentMonitoringDataPoint, BaseAgentFields,
};
use ychaos_core::PlanError;

const DEFAULT_TLS_PORT: u16 = 443;

/// Configuration of the server certificate validation agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCertValidationConfig {
    /// Shared agent fields.
    #[serde(flatten)]
    pub base: BaseAgentFields,
    /// URLs whose served certificates are validated for expiry.
    pub urls: Vec<Url>,
    /// Days before expiry at which a certificate is flagged critical.
    #[serde(default = "default_expiry_threshold_days")]
    pub expiry_threshold_days: u64,
    /// Seconds to wait for each certificate fetch.
    #[serde(default = "default_fetch_timeout")]
    pub timeout: u64,
}

fn default_expiry_threshold_days() -> u64 {
    7
}

fn default_fetch_timeout() -> u64 {
    5
}

impl ServerCertValidationConfig {
    pub(crate) fn validate(&self) -> Result<(), PlanError> {
        if self.urls.is_empty() {
            return Err(PlanError::AgentConfig {
                agent: "server_cert_validation".into(),
                reason: "at least one URL is required".into(),
            });
        }
        Ok(())
    }
}

/// Certificate verifier that accepts everything so the peer chain can be
/// fetched and inspected even when it is expired or self-signed.
#[derive(Debug)]
struct CaptureOnlyVerifier;

impl ServerCertVerifier for CaptureOnlyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

/// Expiry facts extracted from one certificate.
struct CertExpiry {
    not_valid_after: DateTime<Utc>,
}

impl CertExpiry {
    fn from_der(der: &[u8]) -> anyhow::Result<Self> {
        let (_, certificate) = x509_parser::certificate::X509Certificate::from_der(der)?;
        let timestamp = certificate.validity().not_after.timestamp();
        let not_valid_after = DateTime::<Utc>::from_timestamp(timestamp, 0)
            .ok_or_else(|| AgentError::Failed("certificate expiry out of range".into()))?;
        Ok(Self { not_valid_after })
    }

    fn observation(&self, threshold: Duration) -> BTreeMap<String, serde_json::Value> {
        let now = Utc::now();
        let mut data = BTreeMap::new();
        data.insert(
            "not_valid_after".to_string(),
            serde_json::json!(self.not_valid_after.to_rfc3339()),
        );
        data.insert(
            "is_expired".to_string(),
            serde_json::json!(now >= self.not_valid_after),
        );
        data.insert(
            "is_critical".to_string(),
            serde_json::json!(now + threshold >= self.not_valid_after),
        );
        data
    }
}

/// The server certificate validation agent.
pub struct ServerCertValidation {
    config: ServerCertValidationConfig,
    lifecycle: AgentLifecycle,
}

impl ServerCertValidation {
    /// Build the agent from its validated config.
    pub fn new(mut config: ServerCertValidationConfig) -> Self {
        config.base.ensure_named("server_cert_validation");
        Self {
            config,
            lifecycle: AgentLifecycle::new(),
        }
    }

    async fn fetch_server_cert(&self, host: &str, port: u16) -> anyhow::Result<CertExpiry> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(CaptureOnlyVerifier))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));

        let connect = async {
            let tcp = tokio::net::TcpStream::connect((host, port)).await?;
            let server_name = ServerName::try_from(host.to_string())?;
            let tls = connector.connect(server_name, tcp).await?;
            let (_, connection) = tls.get_ref();
            let der = connection
                .peer_certificates()
                .and_then(|certs| certs.first())
                .ok_or_else(|| AgentError::Failed("server presented no certificate".into()))?;
            CertExpiry::from_der(der.as_ref())
        };
        tokio::time::timeout(std::time::Duration::from_secs(self.config.timeout), connect)
            .await
            .map_err(|_| AgentError::Failed(format!("timed out fetching certificate from {host}:{port}")))?
    }
}

#[async_trait]
impl Agent for ServerCertValidation {
    fn base(&self) -> &BaseAgentFields {
        &self.config.base
    }

    fn lifecycle(&self) -> &AgentLifecycle {
        &self.lifecycle
    }

    async fn setup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// One datapoint per URL; fetch errors become error observations rather
    /// than agent failures.
    async fn run(&self) -> anyhow::Result<()> {
        let threshold = Duration::days(self.config.expiry_threshold_days as i64);
        for u in &self.config.urls {
            let host = u.host_str().unwrap_or_default().to_string();
            let port = u.port().unwrap_or(DEFAULT_TLS_PORT);

            let mut data = BTreeMap::new();
            data.insert("host".to_string(), serde_json::json!(host));
            data.insert("port".to_string(), serde_json::json!(port));
            match self.fetch_server_cert(&host, port).await {
                Ok(expiry) => data.extend(expiry.observation(threshold)),
                Err(error) => {
                    data.insert("error".to_string(), serde_json::json!(error.to_string()));
                }
            }
            self.lifecycle
                .push_status(AgentMonitoringDataPoint::now(self.lifecycle.current_state(), data));
        }
        Ok(())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Encoding of a certificate file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CertificateFileType {
    /// PEM encoded certificate.
    #[default]
    Pem,
    /// DER/ASN.1 encoded certificate.
    Asn1,
}

/// One certificate file entry: a bare path (assumed PEM) or a typed entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CertFileEntry {
    /// A typed `{path, type}` entry.
    Typed {
        /// Path to the certificate file.
        path: PathBuf,
        /// Encoding of the file.
        #[serde(rename = "type", default)]
        cert_type: CertificateFileType,
    },
    /// A bare path, assumed PEM.
    Plain(PathBuf),
}

impl CertFileEntry {
    /// The file path of this entry.
    pub fn path(&self) -> &Path {
        match self {
            Self::Plain(path) | Self::Typed { path, .. } => path,
        }
    }

    /// The encoding of this entry.
    pub fn cert_type(&self) -> CertificateFileType {
        match self {
            Self::Plain(_) => CertificateFileType::Pem,
            Self::Typed { cert_type, .. } => *cert_type,
        }
    }
}

/// Configuration of the certificate file validation agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertFileValidationConfig {
    /// Shared agent fields.
    #[serde(flatten)]
    pub base: BaseAgentFields,
    /// Days before expiry at which a certificate is flagged critical.
    #[serde(default = "default_expiry_threshold_days")]
    pub expiry_threshold_days: u64,
    /// Certificate files to validate.
    pub paths: Vec<CertFileEntry>,
}

impl CertFileValidationConfig {
    pub(crate) fn validate(&self) -> Result<(), PlanError> {
        if self.paths.is_empty() {
            return Err(PlanError::AgentConfig {
                agent: "cert_file_validation".into(),
                reason: "at least one certificate path is required".into(),
            });
        }
        Ok(())
    }
}

/// The certificate file validation agent.
pub struct CertFileValidation {
    config: CertFileValidationConfig,
    lifecycle: AgentLifecycle,
}

impl CertFileValidation {
    /// Build the agent from its validated config.
    pub fn new(mut config: CertFileValidationConfig) -> Self {
        config.base.ensure_named("cert_file_validation");
        Self {
            config,
            lifecycle: AgentLifecycle::new(),
        }
    }

    fn decode(entry: &CertFileEntry) -> anyhow::Result<CertExpiry> {
        let bytes = std::fs::read(entry.path())?;
        let der = match entry.cert_type() {
            CertificateFileType::Pem => rustls_pemfile::certs(&mut bytes.as_slice())
                .next()
                .transpose()?
                .ok_or_else(|| AgentError::Failed("no certificate in PEM file".into()))?
                .to_vec(),
            CertificateFileType::Asn1 => bytes,
        };
        CertExpiry::from_der(&der)
    }
}

#[async_trait]
impl Agent for CertFileValidation {
    fn base(&self) -> &BaseAgentFields {
        &self.config.base
    }

    fn lifecycle(&self) -> &AgentLifecycle {
        &self.lifecycle
    }

    async fn setup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self) -> anyhow::Result<()> {
        let threshold = Duration::days(self.config.expiry_threshold_days as i64);
        for entry in &self.config.paths {
            let mut data = BTreeMap::new();
            data.insert(
                "path".to_string(),
                serde_json::json!(entry.path().display().to_string()),
            );
            match Self::decode(entry) {
                Ok(expiry) => data.extend(expiry.observation(threshold)),
                Err(_) => {
                    data.insert("error".to_string(), serde_json::json!("decoding_error"));
                }
            }
            self.lifecycle
                .push_status(AgentMonitoringDataPoint::now(self.lifecycle.current_state(), data));
        }
        Ok(())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_paths_default_to_pem_entries() {
        let config: CertFileValidationConfig = serde_json::from_value(serde_json::json!({
            "paths": ["/etc/ssl/cert.pem", {"path": "/etc/ssl/cert.der", "type": "asn1"}],
        }))
        .expect("config");
        assert_eq!(config.paths[0].cert_type(), CertificateFileType::Pem);
        assert_eq!(config.paths[1].cert_type(), CertificateFileType::Asn1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_url_and_path_lists_are_config_errors() {
        let config: CertFileValidationConfig =
            serde_json::from_value(serde_json::json!({"paths": []})).expect("config");
        assert!(config.validate().is_err());

        let config: ServerCertValidationConfig =
            serde_json::from_value(serde_json::json!({"urls": []})).expect("config");
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn unreadable_cert_file_records_a_decoding_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bogus = dir.path().join("bogus.pem");
        std::fs::write(&bogus, "not a certificate").expect("write");

        let config: CertFileValidationConfig =
            serde_json::from_value(serde_json::json!({"paths": [bogus]})).expect("config");
        let agent = CertFileValidation::new(config);
        agent.run().await.expect("run");

        let datapoint = agent.lifecycle.pop_status().expect("datapoint");
        assert_eq!(
            datapoint.data.get("error"),
            Some(&serde_json::json!("decoding_error"))
        );
    }

    #[test]
    fn server_cert_agent_is_untimed() {
        let config: ServerCertValidationConfig =
            serde_json::from_value(serde_json::json!({"urls": ["https://example.com"]}))
                .expect("config");
        let agent = ServerCertValidation::new(config);
        assert_eq!(agent.duration(), None);
    }
}
