use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{client::TlsStream, rustls, TlsConnector};
use tokio_util::codec;
use tokio_util::codec::Framed;

use crate::invalid_cert_verifier::InvalidServerCertVerifier;

pub enum Connection<Codec> {
    Tls(Framed<TlsStream<TcpStream>, Codec>),
    Unsecured(Framed<TcpStream, Codec>),
}

#[derive(Debug, Clone, Copy)]
pub enum Security {
    Unsecured,
    Secured { accept_invalid_certs: bool },
}

#[derive(Debug, Clone)]
pub struct Config<'a> {
    pub server: &'a str,
    pub port: u16,
    pub security: Security,
}

impl<Codec> Connection<Codec> {
    pub async fn new(config: Config<'_>, codec: Codec) -> Result<Self, Error> {
        let tcp = TcpStream::connect((config.server, config.port)).await?;

        if let Security::Secured {
            accept_invalid_certs,
        } = config.security
        {
            let mut roots = rustls::RootCertStore::empty();
            for cert in rustls_native_certs::load_native_certs().map_err(Error::NativeCerts)? {
                let _ = roots.add(cert);
            }

            let builder = rustls::ClientConfig::builder();
            let client_config = if accept_invalid_certs {
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(InvalidServerCertVerifier::new(
                        roots,
                    )?))
                    .with_no_client_auth()
            } else {
                builder
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            };

            let server_name = rustls::pki_types::ServerName::try_from(config.server.to_owned())
                .map_err(|_| Error::InvalidServerName(config.server.to_owned()))?;
            let tls = TlsConnector::from(Arc::new(client_config));
            let tls = tls.connect(server_name, tcp).await?;

            Ok(Self::Tls(Framed::new(tls, codec)))
        } else {
            Ok(Self::Unsecured(Framed::new(tcp, codec)))
        }
    }

    /// Local address of the underlying socket; the default source for
    /// the advertised DCC endpoint.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Connection::Tls(framed) => framed.get_ref().get_ref().0.local_addr().ok(),
            Connection::Unsecured(framed) => framed.get_ref().local_addr().ok(),
        }
    }

    pub async fn shutdown(self) -> Result<(), Error> {
        match self {
            Connection::Tls(framed) => {
                framed.into_inner().shutdown().await?;
            }
            Connection::Unsecured(framed) => {
                framed.into_inner().shutdown().await?;
            }
        }
        Ok(())
    }
}

/// A bound TCP listener which yields a single connection once accepted.
/// Used for the DCC flows where the port must be advertised to the peer
/// before anyone connects.
pub struct Listener(TcpListener);

impl Listener {
    /// Binds to the first free port in `ports`. A `0..=0` range asks the
    /// OS for an ephemeral port.
    pub async fn bind(address: IpAddr, ports: RangeInclusive<u16>) -> Result<Self, Error> {
        let mut last_error = None;

        for port in ports {
            match TcpListener::bind((address, port)).await {
                Ok(listener) => return Ok(Self(listener)),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.map(Error::Io).unwrap_or(Error::NoFreePort))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.0.local_addr()?)
    }

    pub async fn accept<Codec>(self, codec: Codec) -> Result<Connection<Codec>, Error> {
        let (tcp, _remote) = self.0.accept().await?;

        Ok(Connection::Unsecured(Framed::new(tcp, codec)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not load platform certificates: {0}")]
    NativeCerts(std::io::Error),
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
    #[error("no free port in the configured range")]
    NoFreePort,
}

macro_rules! delegate {
    ($e:expr, $($t:tt)*) => {
        match $e {
            $crate::connection::Connection::Tls(framed) => framed.$($t)*,
            $crate::connection::Connection::Unsecured(framed) => framed.$($t)*,
        }
    };
}

impl<Codec> Stream for Connection<Codec>
where
    Codec: codec::Decoder,
{
    type Item = Result<Codec::Item, Codec::Error>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        delegate!(self.get_mut(), poll_next_unpin(cx))
    }
}

impl<Item, Codec> Sink<Item> for Connection<Codec>
where
    Codec: codec::Encoder<Item>,
{
    type Error = Codec::Error;

    fn poll_ready(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        delegate!(self.get_mut(), poll_ready_unpin(cx))
    }

    fn start_send(self: std::pin::Pin<&mut Self>, item: Item) -> Result<(), Self::Error> {
        delegate!(self.get_mut(), start_send_unpin(item))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        delegate!(self.get_mut(), poll_flush_unpin(cx))
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        delegate!(self.get_mut(), poll_close_unpin(cx))
    }
}
