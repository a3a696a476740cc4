//! Worker admission (C7a, spec.md §4.5): accept up to `MAX_NEW_WORKERS`
//! connections per event-loop iteration, optionally TLS-terminate and
//! password-challenge each one within the short timeout, and hand back a
//! freshly-keyed [`Worker`]-table entry for every connection that
//! survives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use rustls_pemfile::{certs, pkcs8_private_keys};
use socket2::{SockRef, TcpKeepalive};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use shared::defaults::MAX_NEW_WORKERS;

use crate::connection::Connection;
use crate::worker::WorkerId;
use crate::worker::WorkerTable;

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("failed to read TLS key/cert material: {0}")]
    TlsMaterial(#[from] std::io::Error),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("rustls config rejected: {0}")]
    Rustls(#[from] tokio_rustls::rustls::Error),
}

/// Builds the server-side TLS acceptor once at manager startup from a
/// configured key/cert pair (spec.md §4.5, "if TLS is enabled, perform
/// server-side handshake").
pub fn build_tls_acceptor(key_path: &str, cert_path: &str) -> Result<TlsAcceptor, AdmissionError> {
    let cert_bytes = std::fs::read(cert_path)?;
    let key_bytes = std::fs::read(key_path)?;

    let cert_chain: Vec<CertificateDer<'static>> =
        certs(&mut cert_bytes.as_slice()).collect::<Result<Vec<_>, _>>()?;
    let mut keys: Vec<PrivateKeyDer<'static>> = pkcs8_private_keys(&mut key_bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(PrivateKeyDer::Pkcs8)
        .collect();
    let key = keys
        .pop()
        .ok_or_else(|| AdmissionError::NoPrivateKey(key_path.to_string()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// A freshly accepted connection, admitted all the way through TLS and
/// password negotiation, ready to be inserted into the manager's
/// connection table and worker table.
pub struct AdmittedConnection {
    pub worker_id: WorkerId,
    pub connection: Connection,
}

/// Accept up to [`MAX_NEW_WORKERS`] pending connections off `listener`
/// without blocking, admitting each one (TLS handshake, password
/// challenge) within `short_timeout`. Connections that fail admission
/// are dropped silently; they never make it into the worker table
/// (spec.md §4.5).
pub async fn accept_new_workers(
    listener: &TcpListener,
    workers: &mut WorkerTable,
    tls_acceptor: Option<&TlsAcceptor>,
    password: Option<&str>,
    short_timeout: Duration,
    bandwidth_limit_bps: Option<u64>,
) -> Vec<AdmittedConnection> {
    let mut admitted = Vec::new();
    for _ in 0..MAX_NEW_WORKERS {
        let (stream, addr) = match listener.accept().now_or_never() {
            Some(Ok(pair)) => pair,
            Some(Err(e)) => {
                warn!(error = %e, "accept() failed");
                continue;
            }
            None => break,
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, %addr, "failed to set TCP_NODELAY on new worker socket");
        }
        // spec.md §4.5: "set keepalive on the socket" before admission
        // proceeds, so a half-dead peer is caught by the OS even if it
        // never sends another control line.
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(10));
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            warn!(error = %e, %addr, "failed to enable TCP keepalive on new worker socket");
        }

        match admit_one(stream, addr, tls_acceptor, password, short_timeout).await {
            Ok(mut connection) => {
                connection.set_bandwidth_limit(bandwidth_limit_bps);
                let worker_id = workers.insert_new(addr, 0, shared::utils::now_micros());
                info!(%addr, ?worker_id, "worker admitted");
                admitted.push(AdmittedConnection {
                    worker_id,
                    connection,
                });
            }
            Err(reason) => {
                warn!(%addr, %reason, "worker admission failed, dropping connection");
            }
        }
    }
    admitted
}

async fn admit_one(
    stream: TcpStream,
    addr: SocketAddr,
    tls_acceptor: Option<&TlsAcceptor>,
    password: Option<&str>,
    short_timeout: Duration,
) -> Result<Connection, String> {
    match tls_acceptor {
        Some(acceptor) => {
            let mut tls_stream = tokio::time::timeout(short_timeout, acceptor.accept(stream))
                .await
                .map_err(|_| "TLS handshake timed out".to_string())?
                .map_err(|e| format!("TLS handshake failed: {e}"))?;
            if let Some(expected) = password {
                negotiate_password(&mut tls_stream, expected, short_timeout).await?;
            }
            Ok(Connection::new_tls(tls_stream, addr))
        }
        None => {
            let mut stream = stream;
            if let Some(expected) = password {
                negotiate_password(&mut stream, expected, short_timeout).await?;
            }
            Ok(Connection::new_plain(stream, addr))
        }
    }
}

/// Pre-greeting password challenge (supplemented from the original's
/// `link_auth_password`): the worker sends its shared password as a
/// single raw line before its `dataswarm` greeting. This happens before
/// the connection is wrapped in [`Connection`] and joins the regular
/// line-protocol dispatch — a mismatch or timeout drops the connection
/// before it is ever admitted (spec.md §4.1, "`auth` — Reject (password
/// negotiation happens pre-admit)").
async fn negotiate_password<S>(stream: &mut S, expected: &str, short_timeout: Duration) -> Result<(), String>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream
        .write_all(b"auth\n")
        .await
        .map_err(|e| format!("failed to send auth challenge: {e}"))?;

    // Read byte-by-byte rather than through a `BufReader` so that nothing
    // past the terminating `\n` is buffered away from the `Connection`
    // that will own this stream next (its greeting may follow
    // immediately in the same TCP segment).
    let read_line = async {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = stream
                .read(&mut byte)
                .await
                .map_err(|e| format!("i/o error during password challenge: {e}"))?;
            if n == 0 {
                return Err("connection closed during password challenge".to_string());
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        Ok(line)
    };

    let line = tokio::time::timeout(short_timeout, read_line)
        .await
        .map_err(|_| "password challenge timed out".to_string())??;

    let given = line.as_slice();
    let given = std::str::from_utf8(given).unwrap_or("").trim_end_matches('\r');
    if bool::from(given.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err("password mismatch".to_string())
    }
}
