/*
 * net.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Fermoposta, a self-hosted mail platform.
 *
 * Fermoposta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Fermoposta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Fermoposta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! TLS plumbing for both directions: client connect (implicit TLS, plain
//! with STARTTLS upgrade) and server accept (PEM-loaded acceptor, implicit
//! handshake before the banner, upgrade of an accepted plain stream).

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::ClientConfig;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::ServerConfig as RustlsServerConfig;
use tokio_rustls::rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::server::TlsStream as AcceptedTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsServerConfig;

/// Build a root certificate store: platform native certs first, then
/// webpki-roots as fallback.
fn build_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    if let Ok(certs) = rustls_native_certs::load_native_certs() {
        for cert in certs {
            let _ = root_store.add(cert);
        }
    }
    if root_store.is_empty() {
        root_store.roots = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    }
    root_store
}

/// Certificate verifier that accepts anything. Client opt-in for deployments
/// running on self-signed certificates.
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
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

fn client_config(accept_invalid_certs: bool) -> Arc<ClientConfig> {
    if accept_invalid_certs {
        let mut config = ClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyServerCert));
        Arc::new(config)
    } else {
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(build_root_store())
                .with_no_client_auth(),
        )
    }
}

static DEFAULT_CONNECTOR: std::sync::OnceLock<TlsConnector> = std::sync::OnceLock::new();

fn connector(accept_invalid_certs: bool) -> TlsConnector {
    if accept_invalid_certs {
        TlsConnector::from(client_config(true))
    } else {
        DEFAULT_CONNECTOR
            .get_or_init(|| TlsConnector::from(client_config(false)))
            .clone()
    }
}

fn server_name_for(host: &str) -> io::Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid host name"))
}

/// Async TLS stream (wraps tokio-rustls client TlsStream over TcpStream).
pub struct TlsStreamWrapper {
    inner: ClientTlsStream<TcpStream>,
}

impl TlsStreamWrapper {
    /// Connect with implicit TLS (e.g. SMTPS 465, POP3S 995). TCP connect
    /// then immediate TLS handshake, before any protocol bytes.
    pub async fn connect_implicit_tls(
        host: &str,
        port: u16,
        accept_invalid_certs: bool,
    ) -> io::Result<Self> {
        let addr = format!("{}:{}", host, port);
        let tcp = TcpStream::connect(&addr).await?;
        let tls = connector(accept_invalid_certs)
            .connect(server_name_for(host)?, tcp)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;
        Ok(Self { inner: tls })
    }
}

impl AsyncRead for TlsStreamWrapper {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsStreamWrapper {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Plain TCP stream intended for STARTTLS/STLS upgrade (SMTP 587, POP3 110).
pub struct PlainStream {
    inner: TcpStream,
}

impl PlainStream {
    /// Connect without TLS (for protocols that upgrade in-band).
    pub async fn connect(host: &str, port: u16) -> io::Result<Self> {
        let addr = format!("{}:{}", host, port);
        let tcp = TcpStream::connect(&addr).await?;
        Ok(Self { inner: tcp })
    }

    /// Upgrade this plain stream to TLS (after the server accepted the
    /// upgrade command). Consumes `self`, same TCP connection.
    pub async fn upgrade_to_tls(
        self,
        host: &str,
        accept_invalid_certs: bool,
    ) -> io::Result<TlsStreamWrapper> {
        let tls = connector(accept_invalid_certs)
            .connect(server_name_for(host)?, self.inner)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;
        Ok(TlsStreamWrapper { inner: tls })
    }
}

impl AsyncRead for PlainStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PlainStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Connect with implicit TLS (465, 995).
pub async fn connect_implicit_tls(
    host: &str,
    port: u16,
    accept_invalid_certs: bool,
) -> io::Result<TlsStreamWrapper> {
    TlsStreamWrapper::connect_implicit_tls(host, port, accept_invalid_certs).await
}

/// Connect plain; call `PlainStream::upgrade_to_tls` after the server agrees
/// to STARTTLS/STLS.
pub async fn connect_plain(host: &str, port: u16) -> io::Result<PlainStream> {
    PlainStream::connect(host, port).await
}

/// Server-side TLS context: certificate chain and key loaded from PEM files,
/// shared by all sessions of a listener.
#[derive(Clone)]
pub struct TlsServerContext {
    acceptor: TlsAcceptor,
}

impl TlsServerContext {
    /// Load certificate chain and private key from the configured PEM files.
    pub fn from_config(config: &TlsServerConfig) -> io::Result<Self> {
        let cert_pem = std::fs::read(&config.cert_path)?;
        let key_pem = std::fs::read(&config.key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Build from in-memory PEM bytes.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> io::Result<Self> {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<_, _>>()?;
        if certs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no certificates in PEM",
            ));
        }
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])?
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no private key in PEM"))?;
        let config = RustlsServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// TLS handshake on an accepted TCP connection (implicit TLS listener).
    pub async fn accept(&self, tcp: TcpStream) -> io::Result<AcceptedTlsStream<TcpStream>> {
        self.acceptor.accept(tcp).await
    }
}

/// Stream for one server session: plaintext, or TLS after an implicit
/// handshake or an in-band upgrade.
pub enum ServerStream {
    Plain(TcpStream),
    Tls(AcceptedTlsStream<TcpStream>),
}

impl ServerStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, ServerStream::Tls(_))
    }

    /// STARTTLS/STLS: handshake on the underlying TCP connection. Only valid
    /// on a plain stream; the already-TLS case is a protocol error upstream.
    pub async fn upgrade_to_tls(self, ctx: &TlsServerContext) -> io::Result<ServerStream> {
        match self {
            ServerStream::Plain(tcp) => Ok(ServerStream::Tls(ctx.accept(tcp).await?)),
            ServerStream::Tls(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stream is already TLS",
            )),
        }
    }
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ServerStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ServerStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ServerStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ServerStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
