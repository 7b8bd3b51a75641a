use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::Context as _;
use camino::Utf8Path;
use tap::Pipe as _;
use tokio_rustls::TlsAcceptor;

/// Install the ring provider process-wide. Safe to call more than once.
pub fn install_default_crypto_provider() {
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!("default crypto provider is already installed");
    }
}

/// Build the TLS acceptor from the `--sslcert`/`--sslkey` PEM files.
pub fn build_acceptor(cert_file: &Utf8Path, key_file: &Utf8Path) -> anyhow::Result<TlsAcceptor> {
    let mut reader = BufReader::new(File::open(cert_file).with_context(|| format!("couldn't open {cert_file}"))?);
    let certificates = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("read TLS certificate")?;
    anyhow::ensure!(!certificates.is_empty(), "no certificate found in {cert_file}");

    let mut reader = BufReader::new(File::open(key_file).with_context(|| format!("couldn't open {key_file}"))?);
    let private_key = rustls_pemfile::private_key(&mut reader)
        .context("read TLS private key")?
        .with_context(|| format!("no private key found in {key_file}"))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)
        .context("failed to build TLS config")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config).pipe(TlsAcceptor::from))
}
