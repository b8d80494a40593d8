use std::{io, path::Path, sync::Arc};

use axum::{Extension, Router};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder,
    service::TowerToHyperService,
};
use rustls::{
    RootCertStore, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
    server::WebPkiClientVerifier,
};
use tokio::{net::TcpListener, sync::watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::TlsSettings;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },
    #[error("invalid certificate material: {0}")]
    Certificate(String),
    #[error("invalid private key: {0}")]
    PrivateKey(String),
    #[error("tls server configuration failed: {0}")]
    Config(String),
}

/// DER of the leaf certificate the client presented, if any. Inserted into
/// every request served over a TLS connection.
#[derive(Debug, Clone, Default)]
pub struct PeerCertificate(pub Option<Vec<u8>>);

impl PeerCertificate {
    fn from_chain(chain: Option<&[CertificateDer<'static>]>) -> Self {
        Self(chain.and_then(|certs| certs.first()).map(|leaf| leaf.as_ref().to_vec()))
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|err| TlsError::Read {
        path: path.display().to_string(),
        message: err.to_string(),
    })
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| TlsError::Certificate(err.to_string()))?;
    if certs.is_empty() {
        return Err(TlsError::Certificate("no certificates found".into()));
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_slice(pem).map_err(|err| TlsError::PrivateKey(err.to_string()))
}

/// Server config from PEM material. With a client CA, presented client
/// certificates must chain to it; clients without one still complete the
/// handshake so the request handler can answer 401.
pub fn load_server_config(settings: &TlsSettings) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = parse_certificates(&read_file(&settings.cert_path)?)?;
    let key = parse_private_key(&read_file(&settings.key_path)?)?;
    server_config_from_pem(certs, key, settings.client_ca_path.as_deref())
}

fn server_config_from_pem(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_ca_path: Option<&Path>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let builder = ServerConfig::builder();
    let config = match client_ca_path {
        Some(path) => {
            let mut roots = RootCertStore::empty();
            for ca in parse_certificates(&read_file(path)?)? {
                roots
                    .add(ca)
                    .map_err(|err| TlsError::Certificate(err.to_string()))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .map_err(|err| TlsError::Config(err.to_string()))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|err| TlsError::Config(err.to_string()))?;
    Ok(Arc::new(config))
}

/// Accept loop serving `app` over TLS until `shutdown` flips to true.
pub async fn serve_tls(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let acceptor = TlsAcceptor::from(config);
    loop {
        let (stream, remote) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "failed to accept connection");
                    continue;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("tls listener stopping");
                    return Ok(());
                }
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(err) => {
                    debug!(remote = %remote, error = %err, "tls handshake failed");
                    return;
                }
            };
            let peer = PeerCertificate::from_chain(tls.get_ref().1.peer_certificates());
            let service = TowerToHyperService::new(app.layer(Extension(peer)));
            if let Err(err) = Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(tls), service)
                .await
            {
                debug!(remote = %remote, error = %err, "connection closed with error");
            }
        });
    }
}
