//! Transports carrying the line protocol: a spawned child process (stdio)
//! or a long-lived HTTP event stream (SSE).
//!
//! Both transports push [`TransportEvent`]s into one channel. Process exit
//! and stream end are observed as events, never polled.

use std::collections::HashMap;
use std::process::Stdio;

use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{Frame, LineFramer};
use crate::error::{Error, Result};

/// Configuration for a capability server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
}

/// How to reach a capability server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Spawn `command` and speak over its stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Subscribe to an event stream at `url`; requests are POSTed to the
    /// endpoint the server announces.
    Sse { url: String },
}

impl ServerConfig {
    pub fn stdio(
        name: impl Into<String>,
        command: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Stdio {
                command: command.into(),
                args: args.into_iter().map(Into::into).collect(),
                env: HashMap::new(),
            },
        }
    }

    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Sse { url: url.into() },
        }
    }

    /// Short transport label for listings.
    pub fn transport_kind(&self) -> &'static str {
        match self.transport {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::Sse { .. } => "sse",
        }
    }

    /// Reject configs that can never connect.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("server name must not be empty".into()));
        }
        if self.name.contains(':') {
            return Err(Error::Config(format!(
                "server name '{}' must not contain ':'",
                self.name
            )));
        }
        match &self.transport {
            TransportConfig::Stdio { command, .. } if command.trim().is_empty() => Err(
                Error::Config(format!("server '{}' has an empty command", self.name)),
            ),
            TransportConfig::Sse { url } => reqwest::Url::parse(url)
                .map(|_| ())
                .map_err(|e| Error::Config(format!("server '{}' has bad url: {e}", self.name))),
            _ => Ok(()),
        }
    }
}

/// Something observed on the transport.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    Frame(Frame),
    Closed(String),
}

pub(crate) type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// A started transport.
pub(crate) enum Transport {
    Stdio(StdioTransport),
    Sse(SseTransport),
}

impl Transport {
    /// Inbound lines longer than `max_message` bytes arrive as
    /// [`Frame::Oversized`].
    pub(crate) async fn start(
        config: &ServerConfig,
        max_message: usize,
    ) -> Result<(Self, EventReceiver)> {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = match &config.transport {
            TransportConfig::Stdio { command, args, env } => Self::Stdio(StdioTransport::spawn(
                &config.name,
                command,
                args,
                env,
                max_message,
                events,
            )?),
            TransportConfig::Sse { url } => Self::Sse(
                SseTransport::connect(&config.name, url, max_message, events).await?,
            ),
        };
        Ok((transport, rx))
    }

    pub(crate) async fn send(&self, line: &[u8]) -> Result<()> {
        match self {
            Self::Stdio(t) => t.send(line).await,
            Self::Sse(t) => t.send(line).await,
        }
    }

    pub(crate) fn close(&self) {
        match self {
            Self::Stdio(t) => t.close(),
            Self::Sse(t) => t.close(),
        }
    }
}

// --- stdio ---

pub(crate) struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    kill: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl StdioTransport {
    fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        max_message: usize,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdout")))?;
        let stderr = child.stderr.take();

        let reader_events = events.clone();
        tokio::spawn(async move {
            let mut frames = FramedRead::new(stdout, LineFramer::new(max_message));
            let reason = loop {
                match frames.next().await {
                    Some(Ok(frame)) => {
                        if reader_events.send(TransportEvent::Frame(frame)).is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => break format!("stdout read failed: {e}"),
                    None => break "stdout closed".to_string(),
                }
            };
            let _ = reader_events.send(TransportEvent::Closed(reason));
        });

        if let Some(stderr) = stderr {
            let name = server.to_string();
            tokio::spawn(async move {
                let mut frames = FramedRead::new(stderr, LineFramer::default());
                while let Some(Ok(frame)) = frames.next().await {
                    if let Frame::Line(line) = frame {
                        debug!(server = %name, "stderr: {}", String::from_utf8_lossy(&line));
                    }
                }
            });
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let name = server.to_string();
        tokio::spawn(async move {
            let reason = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => format!("process exited ({status})"),
                    Err(e) => format!("failed to wait for process: {e}"),
                },
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(server = %name, "failed to kill server process: {e}");
                    }
                    "closed".to_string()
                }
            };
            debug!(server = %name, %reason, "server process gone");
            let _ = events.send(TransportEvent::Closed(reason));
        });

        Ok(Self {
            stdin: Mutex::new(stdin),
            kill: std::sync::Mutex::new(Some(kill_tx)),
        })
    }

    async fn send(&self, line: &[u8]) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let write = async {
            stdin.write_all(line).await?;
            stdin.flush().await
        };
        write
            .await
            .map_err(|e| Error::ConnectionLost(format!("write to server failed: {e}")))
    }

    fn close(&self) {
        let sender = match self.kill.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

// --- sse ---

pub(crate) struct SseTransport {
    client: reqwest::Client,
    endpoint: watch::Receiver<Option<reqwest::Url>>,
    cancel: CancellationToken,
}

impl SseTransport {
    async fn connect(
        server: &str,
        url: &str,
        max_message: usize,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self> {
        let base = reqwest::Url::parse(url)
            .map_err(|e| Error::Config(format!("server '{server}' has bad url: {e}")))?;
        let client = reqwest::Client::new();

        let response = client
            .get(base.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "event stream returned {}",
                response.status()
            )));
        }

        let (endpoint_tx, endpoint) = watch::channel(None);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let name = server.to_string();

        tokio::spawn(async move {
            let body = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
            let mut frames = FramedRead::new(StreamReader::new(body), LineFramer::new(max_message));
            let mut event = String::new();
            let mut data: Vec<String> = Vec::new();

            let reason = loop {
                let frame = tokio::select! {
                    _ = task_cancel.cancelled() => break "closed".to_string(),
                    frame = frames.next() => frame,
                };
                let line = match frame {
                    Some(Ok(Frame::Line(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(oversized)) => {
                        // Too big to buffer; the connection answers its caller.
                        if events.send(TransportEvent::Frame(oversized)).is_err() {
                            break "receiver dropped".to_string();
                        }
                        continue;
                    }
                    Some(Err(e)) => break format!("event stream failed: {e}"),
                    None => break "event stream ended".to_string(),
                };

                if !line.is_empty() {
                    if let Some(value) = line.strip_prefix("event:") {
                        event = value.trim().to_string();
                    } else if let Some(value) = line.strip_prefix("data:") {
                        data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
                    }
                    continue;
                }

                // A blank line dispatches the accumulated event.
                let payload = data.join("\n");
                data.clear();
                match std::mem::take(&mut event).as_str() {
                    "endpoint" => match base.join(payload.trim()) {
                        Ok(url) => {
                            debug!(server = %name, %url, "sse endpoint announced");
                            let _ = endpoint_tx.send(Some(url));
                        }
                        Err(e) => warn!(server = %name, "bad sse endpoint '{payload}': {e}"),
                    },
                    "" | "message" if !payload.is_empty() => {
                        let frame = Frame::Line(payload.into_bytes());
                        if events.send(TransportEvent::Frame(frame)).is_err() {
                            break "receiver dropped".to_string();
                        }
                    }
                    _ => {}
                }
            };
            let _ = events.send(TransportEvent::Closed(reason));
        });

        Ok(Self {
            client,
            endpoint,
            cancel,
        })
    }

    async fn send(&self, line: &[u8]) -> Result<()> {
        let mut endpoint = self.endpoint.clone();
        let url = {
            let announced = endpoint
                .wait_for(Option::is_some)
                .await
                .map_err(|_| Error::ConnectionLost("event stream closed".into()))?;
            announced.clone()
        };
        let Some(url) = url else {
            return Err(Error::ConnectionLost("no endpoint announced".into()));
        };

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(line.to_vec())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "POST returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}
