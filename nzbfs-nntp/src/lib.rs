//! Concrete NNTP wire client (§4.10): implements
//! [`nzbfs_engine::article::ArticleFetcher`] over a bounded pool of
//! connections, each optionally wrapped in TLS.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};

use nzbfs_engine::article::ArticleFetcher;
use nzbfs_engine::error::WireError;

#[derive(Debug, Clone)]
pub struct NntpConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub max_conn: usize,
    pub connect_timeout: Duration,
}

impl Default for NntpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 119,
            tls: false,
            user: None,
            pass: None,
            max_conn: 8,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

pub struct NntpConnection {
    io: BufReader<Box<dyn Conn>>,
}

impl NntpConnection {
    #[instrument(level = "debug", skip(cfg), fields(host = %cfg.host, port = cfg.port, tls = cfg.tls))]
    async fn connect(cfg: &NntpConfig) -> Result<Self, WireError> {
        let tcp = tokio::time::timeout(cfg.connect_timeout, TcpStream::connect((cfg.host.as_str(), cfg.port)))
            .await
            .map_err(|_| WireError::Connect("connect timed out".into()))?
            .map_err(|e| WireError::Connect(e.to_string()))?;

        let boxed: Box<dyn Conn> = if cfg.tls {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name = ServerName::try_from(cfg.host.clone())
                .map_err(|e| WireError::Connect(format!("invalid server name: {e}")))?;
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| WireError::Connect(e.to_string()))?;
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        let mut conn = NntpConnection {
            io: BufReader::new(boxed),
        };

        let greeting = conn.read_line().await?;
        if !greeting.starts_with('2') {
            return Err(WireError::Connect(format!("unexpected greeting: {greeting}")));
        }
        debug!(%greeting, "connected to nntp server");

        if let Some(user) = &cfg.user {
            let (code, text) = conn.command(&format!("AUTHINFO USER {user}")).await?;
            match code {
                281 => {}
                381 => {
                    let pass = cfg.pass.as_deref().unwrap_or_default();
                    let (code2, text2) = conn.command(&format!("AUTHINFO PASS {pass}")).await?;
                    if code2 != 281 {
                        return Err(WireError::Auth(text2));
                    }
                }
                _ => return Err(WireError::Auth(text)),
            }
        }

        Ok(conn)
    }

    async fn write_line(&mut self, line: &str) -> Result<(), WireError> {
        let io = self.io.get_mut();
        io.write_all(line.as_bytes()).await.map_err(WireError::Io)?;
        io.write_all(b"\r\n").await.map_err(WireError::Io)?;
        io.flush().await.map_err(WireError::Io)?;
        Ok(())
    }

    async fn read_line_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::new();
        let n = self.io.read_until(b'\n', &mut buf).await.map_err(WireError::Io)?;
        if n == 0 {
            return Err(WireError::Connect("connection closed by peer".into()));
        }
        while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
            buf.pop();
        }
        Ok(buf)
    }

    async fn read_line(&mut self) -> Result<String, WireError> {
        Ok(String::from_utf8_lossy(&self.read_line_bytes().await?).into_owned())
    }

    /// Reads a dot-terminated multi-line block, dot-unstuffing as it goes,
    /// restoring `\r\n` line terminators in the output.
    async fn read_multiline(&mut self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        loop {
            let line = self.read_line_bytes().await?;
            if line == b"." {
                break;
            }
            if line.first() == Some(&b'.') {
                out.extend_from_slice(&line[1..]);
            } else {
                out.extend_from_slice(&line);
            }
            out.extend_from_slice(b"\r\n");
        }
        Ok(out)
    }

    async fn command(&mut self, cmd: &str) -> Result<(u32, String), WireError> {
        self.write_line(cmd).await?;
        let line = self.read_line().await?;
        let code = line
            .get(0..3)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| WireError::Connect(format!("malformed response: {line}")))?;
        Ok((code, line))
    }

    async fn select_group(&mut self, group: &str) -> Result<(), WireError> {
        let (code, text) = self.command(&format!("GROUP {group}")).await?;
        if code != 211 {
            return Err(WireError::Connect(format!("GROUP {group} failed: {text}")));
        }
        Ok(())
    }

    async fn body(&mut self, group: &str, id: &str) -> Result<Vec<u8>, WireError> {
        let wrapped = wrap_message_id(id);
        let (code, text) = self.command(&format!("BODY {wrapped}")).await?;
        if code != 222 {
            return Err(WireError::Fetch {
                group: group.to_string(),
                id: id.to_string(),
                reason: text,
            });
        }
        self.read_multiline().await
    }

    /// Multi-line `CAPABILITIES` response; used only for diagnostics, never
    /// to gate behavior.
    pub async fn capabilities(&mut self) -> Result<Vec<String>, WireError> {
        let (code, _) = self.command("CAPABILITIES").await?;
        if code != 101 {
            return Ok(Vec::new());
        }
        let data = self.read_multiline().await?;
        Ok(String::from_utf8_lossy(&data)
            .lines()
            .map(|l| l.to_string())
            .collect())
    }
}

fn wrap_message_id(id: &str) -> String {
    if id.starts_with('<') && id.ends_with('>') {
        id.to_string()
    } else {
        format!("<{id}>")
    }
}

/// A bounded pool of connections: a semaphore caps concurrency, a
/// `parking_lot::Mutex`-guarded `Vec` hands out idle connections (the
/// teacher guards its blob index the same way: a short-held sync lock
/// around pure in-memory bookkeeping, never held across an `.await`).
pub struct NntpClient {
    cfg: NntpConfig,
    idle: Arc<Mutex<Vec<NntpConnection>>>,
    semaphore: Arc<Semaphore>,
}

impl NntpClient {
    pub fn new(cfg: NntpConfig) -> Self {
        let permits = cfg.max_conn.max(1);
        Self {
            cfg,
            idle: Arc::new(Mutex::new(Vec::new())),
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    async fn acquire(&self) -> Result<NntpConnection, WireError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");
        let existing = self.idle.lock().pop();
        match existing {
            Some(conn) => Ok(conn),
            None => NntpConnection::connect(&self.cfg).await,
        }
    }

    fn release(&self, conn: NntpConnection) {
        self.idle.lock().push(conn);
    }
}

#[async_trait]
impl ArticleFetcher for NntpClient {
    #[instrument(level = "debug", skip(self), fields(%group, %id))]
    async fn get_article(
        &self,
        group: &str,
        id: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, WireError> {
        let mut conn = self.acquire().await?;
        let result = async {
            conn.select_group(group).await?;
            conn.body(group, id).await
        }
        .await;

        match result {
            Ok(data) => {
                self.release(conn);
                Ok(Box::new(std::io::Cursor::new(data)) as Box<dyn AsyncRead + Send + Unpin>)
            }
            Err(e) => {
                warn!(%group, %id, error = %e, "article fetch failed, dropping connection");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    /// A minimal fake NNTP server speaking just enough of the protocol to
    /// exercise `NntpClient`: greeting, `GROUP`, and one `BODY`, with a
    /// dot-stuffed line in the body to check unstuffing.
    async fn spawn_fake_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"200 posting ok\r\n").await.unwrap();

            let mut buf = BufReader::new(&mut sock);
            let mut line = String::new();
            tokio::io::AsyncBufReadExt::read_line(&mut buf, &mut line).await.unwrap();
            assert!(line.starts_with("GROUP"));
            buf.get_mut().write_all(b"211 0 0 0 alt.test\r\n").await.unwrap();

            line.clear();
            tokio::io::AsyncBufReadExt::read_line(&mut buf, &mut line).await.unwrap();
            assert!(line.starts_with("BODY"));
            buf.get_mut()
                .write_all(b"222 0 <id@host>\r\n..double-dot\r\nnormal line\r\n.\r\n")
                .await
                .unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn fetches_and_unstuffs_body() {
        let addr = spawn_fake_server().await;
        let client = NntpClient::new(NntpConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..Default::default()
        });
        let mut body = client.get_article("alt.test", "id@host").await.unwrap();
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut body, &mut out).await.unwrap();
        assert_eq!(out, b".double-dot\r\nnormal line\r\n".to_vec());
    }

    #[test]
    fn wraps_bare_message_id() {
        assert_eq!(wrap_message_id("abc@host"), "<abc@host>");
        assert_eq!(wrap_message_id("<abc@host>"), "<abc@host>");
    }
}
