// TLS for the ingest stream: PEM loading, collector acceptor, agent connector.

use anyhow::{Result, anyhow};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::{AgentSection, IngestConfig};

/// Agent-side TLS: connector plus the name the collector certificate must match.
#[derive(Clone)]
pub struct ClientTls {
    pub connector: TlsConnector,
    pub server_name: ServerName,
}

/// Acceptor for the ingest listener, or `None` when no certificate is configured.
pub fn server_acceptor(config: &IngestConfig) -> Result<Option<TlsAcceptor>> {
    match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let server_config = load_server_config(Path::new(cert_path), Path::new(key_path))?;
            Ok(Some(TlsAcceptor::from(server_config)))
        }
        _ => Ok(None),
    }
}

/// Connector trusting `agent.ca_cert_path`, or `None` for a plain TCP stream.
pub fn client_tls(config: &AgentSection) -> Result<Option<ClientTls>> {
    let Some(ca_path) = &config.ca_cert_path else {
        return Ok(None);
    };
    let client_config = load_client_config(Path::new(ca_path))?;
    let name = config
        .server_name
        .clone()
        .unwrap_or_else(|| host_from_addr(&config.server_addr));
    let server_name = ServerName::try_from(name.as_str())
        .map_err(|e| anyhow!("invalid TLS server name {:?}: {}", name, e))?;
    Ok(Some(ClientTls {
        connector: TlsConnector::from(client_config),
        server_name,
    }))
}

pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let cert_chain = load_certs(cert_path)?;
    let private_key = load_private_key(key_path)?;
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| anyhow!("Failed to create TLS config: {}", e))?;
    Ok(Arc::new(config))
}

pub fn load_client_config(ca_path: &Path) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots
            .add(&cert)
            .map_err(|e| anyhow!("invalid CA certificate in {}: {}", ca_path.display(), e))?;
    }
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

type PemParser = fn(&mut dyn BufRead) -> io::Result<Vec<Vec<u8>>>;

fn read_pem(path: &Path, parse: PemParser) -> Result<Vec<Vec<u8>>> {
    let file = File::open(path).map_err(|e| anyhow!("open {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);
    parse(&mut reader).map_err(|e| anyhow!("parse {}: {}", path.display(), e))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let chain: Vec<Certificate> = read_pem(path, certs)?
        .into_iter()
        .map(Certificate)
        .collect();
    if chain.is_empty() {
        return Err(anyhow!("No certificates found in {}", path.display()));
    }
    Ok(chain)
}

/// First PKCS#8 key in the file, else the first PKCS#1 (RSA) key.
fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let mut keys = read_pem(path, pkcs8_private_keys)?;
    if keys.is_empty() {
        keys = read_pem(path, rsa_private_keys)?;
    }
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| anyhow!("No private keys found in {}", path.display()))
}

/// Host part of `host:port`; `localhost` when the host is empty (`:9000`).
pub fn host_from_addr(addr: &str) -> String {
    let trimmed = addr.trim();
    let host = match trimmed.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => trimmed,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        "localhost".into()
    } else {
        host.into()
    }
}
