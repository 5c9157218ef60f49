//! TCP and TLS setup.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{Context as _, Result};
use chatlink_core::{CertificateRejected, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;

/// A connected socket, before IRC registration.
pub enum Established {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// Open a TCP connection to the server, with TLS when configured.
///
/// An untrusted server certificate fails with [`CertificateRejected`] in the
/// error chain unless the server is configured with `tls_insecure`.
pub async fn establish_connection(server: &ServerConfig) -> Result<Established> {
    let use_tls = server.use_tls();
    let mode = if use_tls { "TLS" } else { "plain" };

    tracing::debug!("Resolving {}...", server.address);
    let tcp = TcpStream::connect(&server.address)
        .await
        .with_context(|| format!("TCP connect to {} failed", server.address))?;
    tracing::debug!("TCP connected to {} ({mode})", server.address);

    if !use_tls {
        return Ok(Established::Plain(tcp));
    }

    let tls_config = if server.tls_insecure {
        tracing::debug!("TLS: insecure mode (skipping cert verification)");
        rustls_insecure_config()?
    } else {
        rustls_default_config()
    };
    let connector = TlsConnector::from(Arc::new(tls_config));
    let dns_name = rustls::pki_types::ServerName::try_from(server.host().to_string())
        .with_context(|| format!("invalid TLS server name {}", server.host()))?;
    match connector.connect(dns_name, tcp).await {
        Ok(stream) => {
            tracing::debug!("TLS handshake complete");
            Ok(Established::Tls(Box::new(stream)))
        }
        Err(e) if is_untrusted_certificate(&e) => {
            tracing::warn!(server = %server.address, error = %e, "Server certificate not trusted");
            Err(anyhow::Error::new(CertificateRejected).context(format!("TLS handshake with {} failed: {e}", server.address)))
        }
        Err(e) => Err(anyhow::anyhow!("TLS handshake with {} failed: {e}", server.address)),
    }
}

/// Whether a handshake error came from certificate verification.
pub fn is_untrusted_certificate(err: &io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .is_some_and(|e| matches!(e, rustls::Error::InvalidCertificate(_)))
}

impl AsyncRead for Established {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Established::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Established::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Established {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Established::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Established::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Established::Plain(s) => Pin::new(s).poll_flush(cx),
            Established::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Established::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Established::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

fn install_crypto_provider() {
    // ring wins when both features are on.
    #[cfg(feature = "ring")]
    {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    #[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
    {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

fn rustls_default_config() -> rustls::ClientConfig {
    install_crypto_provider();

    let root_store = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// Trusts any certificate chain but still checks that the server holds the
/// key for the certificate it presented.
fn rustls_insecure_config() -> Result<rustls::ClientConfig> {
    install_crypto_provider();
    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .context("no TLS crypto provider installed")?;
    Ok(rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyChain { provider }))
        .with_no_client_auth())
}

/// Skips chain and hostname checks. Handshake signatures are verified with
/// the provider's algorithms.
#[derive(Debug)]
struct AcceptAnyChain {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyChain {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        tracing::trace!(server = ?server_name, "Accepting unverified certificate chain");
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
