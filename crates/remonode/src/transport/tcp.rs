//! `tcp://host:port` transport.

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use super::Acceptor;
use super::Backend;
use super::Error;
use super::Result;
use super::Transport;

const READ_CHUNK: usize = 16 * 1024;

pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    peer: String,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "could not disable Nagle");
        }
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer,
        }
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; READ_CHUNK];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

fn socket_address(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidAddress(format!("{} has no host", url)))?;
    let port = url
        .port()
        .ok_or_else(|| Error::InvalidAddress(format!("{} has no port", url)))?;
    Ok(format!("{}:{}", host, port))
}

pub struct TcpBackend;

#[async_trait::async_trait]
impl Backend for TcpBackend {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>> {
        let stream = TcpStream::connect(socket_address(url)?).await?;
        Ok(Box::new(TcpTransport::new(stream)))
    }

    async fn listen(&self, url: &Url) -> Result<Box<dyn Acceptor>> {
        let listener = TcpListener::bind(socket_address(url)?).await?;
        let bound = listener.local_addr()?;

        let mut local = url.clone();
        local
            .set_port(Some(bound.port()))
            .map_err(|_| Error::InvalidAddress(url.to_string()))?;

        Ok(Box::new(TcpAcceptor { listener, local }))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    local: Url,
}

#[async_trait::async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> Result<Box<dyn Transport>> {
        let (stream, _) = self.listener.accept().await?;
        Ok(Box::new(TcpTransport::new(stream)))
    }

    fn local_address(&self) -> Url {
        self.local.clone()
    }
}
