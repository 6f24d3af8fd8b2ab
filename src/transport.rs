//! Byte-stream transports to the editor host.
//!
//! Two endpoint kinds are supported:
//!
//! - **TCP** to the editor plugin on a fixed local port. Keep-alive is enabled
//!   before connecting and Nagle is disabled after, since every exchange is a
//!   small request waiting on a small reply.
//! - **Child process** standard streams (the sidecar). stdin/stdout carry the
//!   protocol; stderr is not framed and is drained into a diagnostic buffer.
//!
//! A [`Connection`] splits into a [`TransportReader`] (owned by the read loop),
//! a [`TransportWriter`] (shared by callers) and, for process endpoints, the
//! [`ChildProcess`] handle.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{LinkError, Result};

/// Size of a single read from the underlying stream.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Upper bound on retained child stderr text (1MB); older output is dropped.
const MAX_STDERR_BYTES: usize = 1024 * 1024;

/// How long `terminate` waits for the child after killing it.
const CHILD_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Description of a host process whose stdio carries the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Process(ProcessSpec),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Endpoint::Process(spec) => write!(f, "process {}", spec.program.display()),
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open byte stream, not yet split.
pub struct Connection {
    reader: TransportReader,
    writer: TransportWriter,
    process: Option<ChildProcess>,
}

impl Connection {
    /// Open a connection to `endpoint`.
    ///
    /// # Errors
    ///
    /// - `LinkError::Connect` if the host cannot be resolved or refuses
    /// - `LinkError::Spawn` if the process executable cannot be started
    pub async fn open(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => Self::open_tcp(host, *port).await,
            Endpoint::Process(spec) => Self::spawn(spec),
        }
    }

    /// Wrap an arbitrary stream pair (in-memory pipes, pre-connected sockets).
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: TransportReader::new(Box::new(reader)),
            writer: TransportWriter::new(Box::new(writer)),
            process: None,
        }
    }

    async fn open_tcp(host: &str, port: u16) -> Result<Self> {
        let endpoint = format!("{}:{}", host, port);
        let connect_err = |source: std::io::Error| LinkError::Connect {
            endpoint: endpoint.clone(),
            source,
        };

        let addr: SocketAddr = tokio::net::lookup_host(endpoint.as_str())
            .await
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| {
                connect_err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "host resolved to no addresses",
                ))
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(connect_err)?;
        socket.set_keepalive(true).map_err(connect_err)?;

        let stream: TcpStream = socket.connect(addr).await.map_err(connect_err)?;
        stream.set_nodelay(true).map_err(connect_err)?;

        debug!("Connected to {}", addr);

        let (read_half, write_half) = stream.into_split();
        Ok(Self::from_io(read_half, write_half))
    }

    fn spawn(spec: &ProcessSpec) -> Result<Self> {
        info!("Starting host process: {}", spec.program.display());

        let spawn_err = |source: std::io::Error| LinkError::Spawn {
            program: spec.program.display().to_string(),
            source,
        };

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let missing = |stream: &str| {
            spawn_err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("child {} was not captured", stream),
            ))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let stderr_text = Arc::new(Mutex::new(String::new()));
        let drain = tokio::spawn(drain_stderr(stderr, Arc::clone(&stderr_text)));

        Ok(Self {
            reader: TransportReader::new(Box::new(stdout)),
            writer: TransportWriter::new(Box::new(stdin)),
            process: Some(ChildProcess {
                child,
                stderr: stderr_text,
                drain: Some(drain),
                exit_status: None,
            }),
        })
    }

    /// Split into the read side, the write side and the optional process.
    pub fn into_parts(self) -> (TransportReader, TransportWriter, Option<ChildProcess>) {
        (self.reader, self.writer, self.process)
    }
}

/// Read side of a connection.
pub struct TransportReader {
    inner: BoxedReader,
    chunk: Box<[u8]>,
}

impl TransportReader {
    fn new(inner: BoxedReader) -> Self {
        Self {
            inner,
            chunk: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
        }
    }

    /// Receive the next chunk of bytes.
    ///
    /// Returns an empty vector when the peer closed the stream.
    ///
    /// # Errors
    ///
    /// - `LinkError::Timeout` if `deadline` passes before any bytes arrive
    /// - `LinkError::Transport` on a read failure
    pub async fn receive(&mut self, deadline: Option<Instant>) -> Result<Vec<u8>> {
        let read = self.inner.read(&mut self.chunk);
        let count = match deadline {
            Some(deadline) => {
                let started = Instant::now();
                tokio::time::timeout_at(deadline, read)
                    .await
                    .map_err(|_| LinkError::Timeout(started.elapsed()))?
            }
            None => read.await,
        }?;

        Ok(self.chunk[..count].to_vec())
    }
}

/// Write side of a connection.
pub struct TransportWriter {
    inner: Option<BoxedWriter>,
}

impl TransportWriter {
    fn new(inner: BoxedWriter) -> Self {
        Self { inner: Some(inner) }
    }

    /// Write all of `bytes` and flush.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Transport` on any write failure or after `close`.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = self
            .inner
            .as_mut()
            .ok_or_else(|| LinkError::Transport("Write side is closed".to_string()))?;

        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shut down the write side. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.inner.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Ignoring error while closing writer: {}", e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

/// A spawned host process and its captured stderr.
pub struct ChildProcess {
    child: Child,
    stderr: Arc<Mutex<String>>,
    drain: Option<JoinHandle<()>>,
    exit_status: Option<ExitStatus>,
}

impl ChildProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Stop the process if it is still running and wait for it to exit.
    ///
    /// Idempotent. Returns the exit status once known.
    pub async fn terminate(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_some() {
            return self.exit_status;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("Host process already exited: {}", status);
                self.exit_status = Some(status);
            }
            Ok(None) => {
                if let Err(e) = self.child.start_kill() {
                    warn!("Failed to kill host process: {}", e);
                }
                match tokio::time::timeout(CHILD_EXIT_TIMEOUT, self.child.wait()).await {
                    Ok(Ok(status)) => self.exit_status = Some(status),
                    Ok(Err(e)) => warn!("Error waiting for host process: {}", e),
                    Err(_) => warn!("Host process did not exit within {:?}", CHILD_EXIT_TIMEOUT),
                }
            }
            Err(e) => warn!("Error polling host process: {}", e),
        }

        // stderr reaches EOF once the process is gone; let the drain finish.
        if let Some(drain) = self.drain.take() {
            if tokio::time::timeout(CHILD_EXIT_TIMEOUT, drain).await.is_err() {
                debug!("stderr drain still running after process exit");
            }
        }

        self.exit_status
    }

    /// Diagnostic text collected from the process's stderr so far.
    pub fn stderr_text(&self) -> String {
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn drain_stderr(stderr: ChildStderr, sink: Arc<Mutex<String>>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(target: "editorlink::host_stderr", "{}", line);
                let mut text = sink.lock().unwrap_or_else(PoisonError::into_inner);
                text.push_str(&line);
                text.push('\n');
                if text.len() > MAX_STDERR_BYTES {
                    let mut cut = text.len() - MAX_STDERR_BYTES;
                    while !text.is_char_boundary(cut) {
                        cut += 1;
                    }
                    text.drain(..cut);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("stderr drain stopped: {}", e);
                break;
            }
        }
    }
}
