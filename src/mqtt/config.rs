use std::sync::Arc;
use std::time::Duration;

use rumqttc::tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rumqttc::tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, SignatureScheme};
use rumqttc::{MqttOptions, TlsConfiguration, Transport};
use url::Url;

use super::mqtt_handler::DeliveryError;

/// Connection settings for the remote broker.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteOptions {
    /// `mqtt://`, `tcp://`, `mqtts://` or `ssl://` url of the broker.
    pub url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Verify the broker certificate on TLS connections.
    pub reject_unauthorized: bool,
    pub reconnect_period: Duration,
    pub keep_alive: Duration,
}

/// Translates [`RemoteOptions`] into rumqttc options, picking a TLS transport
/// for secure url schemes.
pub fn build_mqtt_options(options: &RemoteOptions) -> Result<MqttOptions, DeliveryError> {
    let parsed = Url::parse(&options.url)
        .map_err(|e| DeliveryError::InvalidUrl(format!("{}: {}", options.url, e)))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| DeliveryError::InvalidUrl(format!("{}: missing host", options.url)))?;

    let scheme = parsed.scheme().to_ascii_lowercase();
    let (default_port, secure) = match scheme.as_str() {
        "mqtt" | "tcp" => (1883, false),
        "mqtts" | "ssl" => (8883, true),
        other => return Err(DeliveryError::UnsupportedScheme(other.to_string())),
    };
    let port = parsed.port().unwrap_or(default_port);

    let mut mqtt_options = MqttOptions::new(options.client_id.clone(), host, port);
    mqtt_options.set_keep_alive(options.keep_alive);

    if let Some(user) = options.username.as_deref().filter(|u| !u.is_empty()) {
        let password = options.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(user, password);
    }

    if secure {
        mqtt_options.set_transport(tls_transport(options.reject_unauthorized));
    }

    Ok(mqtt_options)
}

fn tls_transport(reject_unauthorized: bool) -> Transport {
    if reject_unauthorized {
        return Transport::tls_with_default_config();
    }

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(config)))
}

/// Accepts self-signed and otherwise invalid broker certificates.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
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
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
