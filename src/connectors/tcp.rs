//! Implementation of [backend::Connector] for TCP, optionally wrapped in TLS.

use crate::backend::{self, Backend, BoxedIo, Error};
use crate::protocol;
use crate::tls::SharedTls;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Default)]
pub struct TcpConnector {
    /// If set, every connection negotiates TLS before carrying any
    /// PostgreSQL traffic.
    pub tls: Option<SharedTls>,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tls(tls: SharedTls) -> Self {
        Self { tls: Some(tls) }
    }
}

#[async_trait]
impl backend::Connector for TcpConnector {
    async fn connect(&self, backend: &Backend) -> Result<BoxedIo, Error> {
        let mut stream = TcpStream::connect((backend.host.as_str(), backend.port)).await?;
        stream.set_nodelay(true)?;

        let Some(tls) = &self.tls else {
            return Ok(Box::new(stream));
        };

        let mut request = BytesMut::new();
        protocol::put_ssl_request(&mut request);
        stream.write_all(&request).await?;
        match stream.read_u8().await? {
            b'S' => Ok(tls.connect(Box::new(stream), &backend.host).await?),
            _ => Err(Error::TlsRefused),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::Connector;
    use crate::test_utils::PlainTls;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let connector = TcpConnector::new();
        let _io = connector
            .connect(&Backend::new(addr.ip(), addr.port()))
            .await
            .unwrap();
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_tls_negotiation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        for answer in [b'S', b'N'] {
            let accept = {
                let listener = &listener;
                async move {
                    let (mut socket, _) = listener.accept().await.unwrap();
                    let mut request = [0; 8];
                    socket.read_exact(&mut request).await.unwrap();
                    assert_eq!(&request[4..], &protocol::SSL_REQUEST_CODE.to_be_bytes());
                    socket.write_all(&[answer]).await.unwrap();
                    socket
                }
            };
            let tls = Arc::new(PlainTls::default());
            let connector = TcpConnector::with_tls(tls.clone());
            let backend = Backend::new(addr.ip(), addr.port());
            let (result, _socket) = tokio::join!(connector.connect(&backend), accept);
            match answer {
                b'S' => {
                    assert!(result.is_ok());
                    assert_eq!(tls.connects.load(Ordering::SeqCst), 1);
                }
                _ => {
                    assert!(matches!(result, Err(Error::TlsRefused)));
                    assert_eq!(tls.connects.load(Ordering::SeqCst), 0);
                }
            }
        }
    }
}
