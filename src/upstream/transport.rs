use crate::config::TransportConfig;
use crate::proxy::context::BoxBody;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;

/// Certificate verifier for the Insecure flag: any server certificate is
/// accepted, but handshake signatures are still checked against the
/// provider's algorithms, so a corrupted handshake fails even when the
/// identity check is skipped.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: rustls::crypto::CryptoProvider,
}

impl AcceptAnyServerCert {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            provider: rustls::crypto::ring::default_provider(),
        })
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS client config shared by the pooled client and the upgrade dialer.
pub fn build_tls_config(insecure: bool) -> rustls::ClientConfig {
    if insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(AcceptAnyServerCert::new())
            .with_no_client_auth()
    } else {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}

pub type HttpClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

/// Build the outbound hyper client shared by all routes.
///
/// - Plain `http://` goes through the inner `HttpConnector` directly;
///   `https://` is terminated with rustls (ring backend).
/// - The pool keeps up to `idle_connections_per_host` idle connections per
///   host. The idle timeout is capped by `close_idle_conns_period` so that
///   pooled connections are re-dialed regularly and DNS changes are picked
///   up, instead of pinning a resolved address forever.
pub fn build_http_client(config: &TransportConfig, insecure: bool) -> HttpClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(config.keep_alive));
    http.set_connect_timeout(Some(config.connect_timeout));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(build_tls_config(insecure))
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);

    let idle_timeout = match config.close_idle_conns_period {
        Some(sweep) => sweep.min(config.keep_alive),
        None => config.keep_alive,
    };

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(idle_timeout)
        .pool_max_idle_per_host(config.idle_connections_per_host)
        .build(https)
}

/// Default port for dialing when an endpoint host carries none.
pub fn default_port(scheme: &str) -> u16 {
    if scheme == "https" {
        443
    } else {
        80
    }
}

/// `host[:port]` → address usable by `TcpStream::connect`.
pub fn dial_address(scheme: &str, host: &str) -> String {
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, default_port(scheme))
    }
}
