use std::{fs::File, future::Future, io::{self, BufReader}, net::SocketAddr, path::{Path, PathBuf}, sync::Arc};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::{net::{TcpListener, TcpStream, ToSocketAddrs}, task::JoinHandle};
use tokio_rustls::{rustls::{pki_types::{CertificateDer, PrivateKeyDer}, ServerConfig}, TlsAcceptor};
use tracing::{debug, info};

/// hands every accepted tcp stream to a [`Wire`], over tls when configured
pub struct Server<W> {
    wire: W,
    tls: Option<TlsAcceptor>,
}

/// a bound server; awaiting `task` yields the accept loop's failure
pub struct Listening {
    pub local_addr: SocketAddr,
    pub task: JoinHandle<io::Result<()>>,
}

impl<W> Server<W>
where
    W: Wire + Send + Sync + 'static,
{
    pub fn new(wire: W) -> Self {
        Self { wire, tls: None }
    }

    pub fn with_tls(mut self, cert: &CertificatePath) -> io::Result<Self> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert.load_certs()?, cert.load_key()?)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        self.tls = Some(TlsAcceptor::from(Arc::new(config)));
        Ok(self)
    }

    /// binds before returning, so address errors surface to the caller
    pub async fn bind(self, addr: impl ToSocketAddrs) -> io::Result<Listening> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        info!("[tcp] listening on {}://{}", scheme, local_addr);

        let task = tokio::spawn(self.accept_loop(listener));
        Ok(Listening { local_addr, task })
    }

    async fn accept_loop(self, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            debug!(%peer_addr, "[stream] incoming");
            self.wire.accept(stream, peer_addr, self.tls.clone()).await;
        }
    }
}

pub struct CertificatePath {
    cert: PathBuf,
    private_key: PathBuf
}

impl CertificatePath {
    pub fn new(cert: impl AsRef<Path>, private_key: impl AsRef<Path>) -> Self {
        let cert = cert.as_ref().to_owned();
        let private_key = private_key.as_ref().to_owned();
        CertificatePath { cert, private_key }
    }

    fn load_certs(&self) -> io::Result<Vec<CertificateDer<'static>>> {
        certs(&mut BufReader::new(File::open(&self.cert)?)).collect()
    }

    fn load_key(&self) -> io::Result<PrivateKeyDer<'static>> {
        pkcs8_private_keys(&mut BufReader::new(File::open(&self.private_key)?))
            .next()
            .ok_or_else(|| io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no pkcs8 private key in {}", self.private_key.display()),
            ))?
            .map(Into::into)
    }
}

/// takes one tcp connection; implementations hand it off and return
pub trait Wire {
    fn accept(&self, stream: TcpStream, peer: SocketAddr, tls: Option<TlsAcceptor>) -> impl Future<Output = ()> + Send;
}

#[cfg(test)]
mod tests {
    use tokio::{io::{AsyncReadExt, AsyncWriteExt}, sync::mpsc};
    use super::*;

    /// answers every connection with a fixed line
    struct Greeter(mpsc::UnboundedSender<SocketAddr>);

    impl Wire for Greeter {
        async fn accept(&self, mut stream: TcpStream, peer: SocketAddr, tls: Option<TlsAcceptor>) {
            assert!(tls.is_none());
            let _ = self.0.send(peer);
            let _ = stream.write_all(b"hello").await;
        }
    }

    #[tokio::test]
    async fn accepts_plain_connections() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listening = Server::new(Greeter(tx)).bind("127.0.0.1:0").await.unwrap();

        for _ in 0..2 {
            let mut client = TcpStream::connect(listening.local_addr).await.unwrap();
            let mut greeting = String::new();
            client.read_to_string(&mut greeting).await.unwrap();
            assert_eq!(greeting, "hello");
            assert_eq!(rx.recv().await, Some(client.local_addr().unwrap()));
        }
        listening.task.abort();
    }

    #[test]
    fn missing_key_file() {
        let cert = CertificatePath::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(cert.load_key().is_err());
        assert!(cert.load_certs().is_err());
    }
}
