//! Connection to an out-of-process cache plugin
//!
//! Requests and responses are single JSON lines. Object payloads travel hex
//! encoded.
//!
//! | op | request | response |
//! |----|---------|----------|
//! | `hello` | `name`, `protocol`, `nfiles` | `capabilities`, `protocol` |
//! | `get` | `key` | `found`, `data` |
//! | `put` | `key`, `data` | |
//! | `probe` | `key` | `found` |
//! | `info` | | `size`, `capacity` |
//! | `cleanup` | `leave_size` | `ok` |

use crate::cache::ContentKey;
use crate::error::{StrataError, StrataResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Protocol revision announced in `hello`
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable telling a spawned plugin where to listen
pub const LOCATOR_ENV: &str = "STRATA_PLUGIN_LOCATOR";

/// Upper bound of one response line; objects travel hex encoded
pub const MAX_RESPONSE_BYTES: u64 = 512 << 20;

const CONNECT_ATTEMPTS: u32 = 8;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Where the plugin listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Unix(PathBuf),
    Tcp(String),
}

impl Locator {
    /// Parse `unix=<path>` or `tcp=<host>:<port>`
    pub fn parse(value: &str) -> StrataResult<Self> {
        let (scheme, target) = value
            .split_once('=')
            .ok_or_else(|| StrataError::invalid(format!("malformed plugin locator '{}'", value)))?;
        if target.is_empty() {
            return Err(StrataError::invalid(format!(
                "plugin locator '{}' has no target",
                value
            )));
        }
        match scheme {
            "unix" => Ok(Self::Unix(PathBuf::from(target))),
            "tcp" => {
                if !target.contains(':') {
                    return Err(StrataError::invalid(format!(
                        "plugin locator '{}' lacks a port",
                        value
                    )));
                }
                Ok(Self::Tcp(target.to_string()))
            }
            other => Err(StrataError::invalid(format!(
                "unknown plugin locator scheme '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix={}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp={}", addr),
        }
    }
}

/// Request line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello {
        name: String,
        protocol: u32,
        nfiles: u64,
    },
    Get {
        key: String,
    },
    Put {
        key: String,
        data: String,
    },
    Probe {
        key: String,
    },
    Info,
    Cleanup {
        leave_size: u64,
    },
}

/// Response line; fields not relevant to an op are omitted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<u32>,
}

impl Response {
    pub fn success() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

trait Duplex: AsyncBufRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncBufRead + AsyncWrite + Unpin + Send> Duplex for T {}

/// An established plugin session
pub struct PluginConnection {
    locator: Locator,
    stream: Mutex<Box<dyn Duplex>>,
    // Set while a request awaits its reply; still set afterwards if the reply
    // was abandoned, leaving the stream out of step
    broken: AtomicBool,
    max_response: u64,
    capabilities: Vec<String>,
    // Killed when the connection goes away
    child: Option<Child>,
}

impl fmt::Debug for PluginConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginConnection")
            .field("locator", &self.locator)
            .field("capabilities", &self.capabilities)
            .field("spawned", &self.child.is_some())
            .field("broken", &self.is_broken())
            .finish()
    }
}

impl PluginConnection {
    /// Connect to a running plugin, or launch `cmdline` and connect to it.
    ///
    /// No handshake is performed; see [`Self::handshake`].
    pub async fn establish(locator: Locator, cmdline: &[String]) -> StrataResult<Self> {
        match connect(&locator).await {
            Ok(stream) => {
                debug!("Connected to running cache plugin at {}", locator);
                return Ok(Self::new(locator, stream, None));
            }
            Err(e) if cmdline.is_empty() => {
                return Err(StrataError::unavailable(format!(
                    "cannot connect to cache plugin at {}: {}",
                    locator, e
                )));
            }
            Err(e) => debug!("Cache plugin not reachable at {} ({}), launching it", locator, e),
        }

        let child = spawn(&locator, cmdline)?;
        let mut backoff = INITIAL_BACKOFF;
        let mut last_error = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            tokio::time::sleep(backoff).await;
            match connect(&locator).await {
                Ok(stream) => {
                    info!("Launched cache plugin {} at {}", cmdline[0], locator);
                    return Ok(Self::new(locator, stream, Some(child)));
                }
                Err(e) => {
                    debug!("Plugin connect attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                }
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        Err(StrataError::unavailable(format!(
            "cache plugin {} did not come up at {}: {}",
            cmdline[0],
            locator,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn new(locator: Locator, stream: Box<dyn Duplex>, child: Option<Child>) -> Self {
        Self {
            locator,
            stream: Mutex::new(stream),
            broken: AtomicBool::new(false),
            max_response: MAX_RESPONSE_BYTES,
            capabilities: Vec::new(),
            child,
        }
    }

    /// Limit the size of a single response line
    pub fn with_response_limit(mut self, bytes: u64) -> Self {
        self.max_response = bytes;
        self
    }

    /// The stream lost request/response alignment and cannot be used again
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    /// Capabilities announced by the plugin during the handshake
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Announce ourselves; the plugin must accept our protocol revision
    pub async fn handshake(&mut self, name: &str, nfiles: u64) -> StrataResult<()> {
        let response = self
            .call(&Request::Hello {
                name: name.to_string(),
                protocol: PROTOCOL_VERSION,
                nfiles,
            })
            .await
            .map_err(|e| StrataError::unavailable(format!("plugin handshake failed: {}", e)))?;

        if let Some(version) = response.protocol {
            if version != PROTOCOL_VERSION {
                return Err(StrataError::unavailable(format!(
                    "plugin speaks protocol {}, expected {}",
                    version, PROTOCOL_VERSION
                )));
            }
        }
        self.capabilities = response.capabilities;
        Ok(())
    }

    /// Send one request and wait for its response without interpreting `ok`
    pub async fn exchange(&self, request: &Request) -> StrataResult<Response> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');

        let mut stream = self.stream.lock().await;
        if self.is_broken() {
            return Err(StrataError::Protocol(
                "plugin connection is out of sync".into(),
            ));
        }
        self.broken.store(true, Ordering::Release);

        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| StrataError::io("writing plugin request", e))?;
        stream
            .flush()
            .await
            .map_err(|e| StrataError::io("writing plugin request", e))?;

        let mut reply = String::new();
        let n = (&mut **stream)
            .take(self.max_response)
            .read_line(&mut reply)
            .await
            .map_err(|e| StrataError::io("reading plugin response", e))?;
        if n == 0 {
            return Err(StrataError::Protocol("plugin closed the connection".into()));
        }
        if !reply.ends_with('\n') {
            return Err(StrataError::Protocol(format!(
                "plugin response exceeds {} bytes",
                self.max_response
            )));
        }
        self.broken.store(false, Ordering::Release);

        serde_json::from_str(reply.trim_end())
            .map_err(|e| StrataError::Protocol(format!("malformed plugin response: {}", e)))
    }

    /// Like [`Self::exchange`], failing on a negative response
    pub async fn call(&self, request: &Request) -> StrataResult<Response> {
        let response = self.exchange(request).await?;
        if !response.ok {
            return Err(StrataError::Protocol(
                response
                    .error
                    .unwrap_or_else(|| "plugin reported an unspecified error".to_string()),
            ));
        }
        Ok(response)
    }

    pub async fn get(&self, key: &ContentKey) -> StrataResult<Option<Vec<u8>>> {
        let response = self.call(&Request::Get { key: key.to_string() }).await?;
        if !response.found {
            return Ok(None);
        }
        let data = response.data.unwrap_or_default();
        hex::decode(data)
            .map(Some)
            .map_err(|e| StrataError::Protocol(format!("object {} is not valid hex: {}", key, e)))
    }

    pub async fn put(&self, key: &ContentKey, data: &[u8]) -> StrataResult<()> {
        self.call(&Request::Put {
            key: key.to_string(),
            data: hex::encode(data),
        })
        .await
        .map(drop)
    }

    pub async fn probe(&self, key: &ContentKey) -> StrataResult<bool> {
        let response = self.call(&Request::Probe { key: key.to_string() }).await?;
        Ok(response.found)
    }

    /// Occupied bytes and capacity
    pub async fn info(&self) -> StrataResult<(u64, u64)> {
        let response = self.call(&Request::Info).await?;
        Ok((
            response.size.unwrap_or(0),
            response.capacity.unwrap_or(u64::MAX),
        ))
    }

    pub async fn cleanup(&self, leave_size: u64) -> StrataResult<bool> {
        let response = self.exchange(&Request::Cleanup { leave_size }).await?;
        if let Some(error) = response.error.as_deref() {
            warn!("Plugin cleanup reported: {}", error);
        }
        Ok(response.ok)
    }
}

async fn connect(locator: &Locator) -> io::Result<Box<dyn Duplex>> {
    match locator {
        Locator::Unix(path) => {
            let stream = UnixStream::connect(path).await?;
            Ok(Box::new(BufReader::new(stream)))
        }
        Locator::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(BufReader::new(stream)))
        }
    }
}

fn spawn(locator: &Locator, cmdline: &[String]) -> StrataResult<Child> {
    let (program, args) = cmdline
        .split_first()
        .ok_or_else(|| StrataError::invalid("empty plugin command line"))?;
    Command::new(program)
        .args(args)
        .env(LOCATOR_ENV, locator.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| StrataError::unavailable(format!("failed to launch {}: {}", program, e)))
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn locator_parse() {
        assert_eq!(
            Locator::parse("unix=/run/plugin.sock").unwrap(),
            Locator::Unix(PathBuf::from("/run/plugin.sock"))
        );
        assert_eq!(
            Locator::parse("tcp=127.0.0.1:4929").unwrap(),
            Locator::Tcp("127.0.0.1:4929".to_string())
        );
        assert_eq!(
            Locator::parse("unix=/run/p.sock").unwrap().to_string(),
            "unix=/run/p.sock"
        );
    }

    #[test]
    fn locator_parse_rejects_malformed() {
        for bad in ["", "unix", "unix=", "tcp=localhost", "http=example.org:80"] {
            assert!(Locator::parse(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn request_wire_format() {
        let line = serde_json::to_string(&Request::Cleanup { leave_size: 7 }).unwrap();
        assert_eq!(line, r#"{"op":"cleanup","leave_size":7}"#);
        let line = serde_json::to_string(&Request::Info).unwrap();
        assert_eq!(line, r#"{"op":"info"}"#);
    }

    #[test]
    fn response_defaults_missing_fields() {
        let response: Response = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert!(response.ok);
        assert!(!response.found);
        assert!(response.capabilities.is_empty());
    }

    #[tokio::test]
    async fn handshake_and_round_trip() {
        let temp = tempfile::TempDir::new().unwrap();
        let socket = temp.path().join("plugin.sock");
        let server = fake::serve(&socket, 4096);

        let mut conn = PluginConnection::establish(Locator::Unix(socket), &[])
            .await
            .unwrap();
        conn.handshake("test", 16).await.unwrap();
        assert_eq!(conn.capabilities(), ["cleanup".to_string()]);

        let key = ContentKey::digest(b"remote");
        assert_eq!(conn.get(&key).await.unwrap(), None);
        conn.put(&key, b"remote").await.unwrap();
        assert!(conn.probe(&key).await.unwrap());
        assert_eq!(conn.get(&key).await.unwrap().unwrap(), b"remote");
        assert_eq!(conn.info().await.unwrap(), (6, 4096));
        assert!(conn.cleanup(0).await.unwrap());
        server.abort();
    }

    /// Answer every request with `reply` after `delay`
    fn scripted(path: &Path, reply: String, delay: Duration) -> tokio::task::JoinHandle<()> {
        let listener = tokio::net::UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(_)) = lines.next_line().await {
                tokio::time::sleep(delay).await;
                if write.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        })
    }

    #[tokio::test]
    async fn oversized_response_breaks_connection() {
        let temp = tempfile::TempDir::new().unwrap();
        let socket = temp.path().join("plugin.sock");
        let reply = format!("{{\"ok\":true,\"data\":\"{}\"}}\n", "ab".repeat(64));
        let server = scripted(&socket, reply, Duration::ZERO);

        let conn = PluginConnection::establish(Locator::Unix(socket), &[])
            .await
            .unwrap()
            .with_response_limit(32);
        let key = ContentKey::digest(b"big");
        let err = conn.get(&key).await.unwrap_err();
        assert!(err.to_string().contains("exceeds 32 bytes"));
        assert!(conn.is_broken());
        assert!(conn.probe(&key).await.is_err());
        server.abort();
    }

    #[tokio::test]
    async fn abandoned_reply_breaks_connection() {
        let temp = tempfile::TempDir::new().unwrap();
        let socket = temp.path().join("plugin.sock");
        let server = scripted(
            &socket,
            "{\"ok\":true,\"found\":true}\n".to_string(),
            Duration::from_millis(200),
        );

        let conn = PluginConnection::establish(Locator::Unix(socket), &[])
            .await
            .unwrap();
        let key = ContentKey::digest(b"slow");
        let cancelled = tokio::time::timeout(Duration::from_millis(20), conn.probe(&key)).await;
        assert!(cancelled.is_err());
        assert!(conn.is_broken());

        let err = conn.probe(&key).await.unwrap_err();
        assert!(matches!(err, StrataError::Protocol(_)));
        server.abort();
    }

    #[tokio::test]
    async fn unreachable_plugin_without_cmdline() {
        let temp = tempfile::TempDir::new().unwrap();
        let locator = Locator::Unix(temp.path().join("missing.sock"));
        let err = PluginConnection::establish(locator, &[]).await.unwrap_err();
        assert!(matches!(err, StrataError::BackendUnavailable(_)));
    }
}
