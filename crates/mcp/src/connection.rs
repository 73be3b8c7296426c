//! One live connection to a capability server: handshake, tool discovery,
//! multiplexed tool calls and liveness tracking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::codec::{self, Frame, Inbound, MAX_MESSAGE_SIZE, Outbound};
use crate::error::{Error, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult, RequestId, Tool,
};
use crate::transport::{EventReceiver, ServerConfig, Transport, TransportEvent};

/// Default timeout for MCP requests other than tool calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default bound on the `initialize` handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of a connection.
///
/// `Connecting → Ready` after the handshake and first tool listing.
/// `Ready ⇄ Degraded` follows call failures and recoveries. `Dead` is
/// terminal: a new connection has to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Degraded,
    Dead,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Dead => "dead",
        };
        f.pad(label)
    }
}

/// Called once, with the reason, when a connection that was up dies
/// without being closed by its owner.
pub type DeadHook = Box<dyn FnOnce(String) + Send + 'static>;

/// Limits applied by a connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Bounds starting the transport and the `initialize` exchange.
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Largest inbound message; bigger replies fail their request.
    pub max_message_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            request_timeout: DEFAULT_TIMEOUT,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

type Pending = Mutex<HashMap<RequestId, oneshot::Sender<Result<Value>>>>;

/// Handle to a connected capability server.
///
/// Dropping the handle shuts the transport down.
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    options: ConnectOptions,
    transport: Transport,
    state: watch::Sender<ConnectionState>,
    pending: Pending,
    next_id: AtomicI64,
    tools: RwLock<Vec<Tool>>,
    server_info: Mutex<Option<InitializeResult>>,
    on_dead: Mutex<Option<DeadHook>>,
    closing: AtomicBool,
}

impl Connection {
    /// Start the transport, perform the handshake and list tools.
    pub async fn connect(config: ServerConfig, options: ConnectOptions) -> Result<Self> {
        Self::connect_with_hook(config, options, None).await
    }

    /// Like [`Connection::connect`], registering `on_dead` before the
    /// transport starts so no death can be missed.
    pub async fn connect_with_hook(
        config: ServerConfig,
        options: ConnectOptions,
        on_dead: Option<DeadHook>,
    ) -> Result<Self> {
        config.validate()?;
        let started = tokio::time::timeout(
            options.connect_timeout,
            Transport::start(&config, options.max_message_size),
        )
        .await;
        let (transport, events) = started.map_err(|_| Error::Timeout(options.connect_timeout))??;
        let (state, _) = watch::channel(ConnectionState::Connecting);

        let inner = Arc::new(Inner {
            config,
            options,
            transport,
            state,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            tools: RwLock::new(Vec::new()),
            server_info: Mutex::new(None),
            on_dead: Mutex::new(on_dead),
            closing: AtomicBool::new(false),
        });
        tokio::spawn(read_loop(Arc::downgrade(&inner), events));

        let connection = Self { inner };
        if let Err(e) = connection.handshake().await {
            warn!(server = %connection.name(), "handshake failed: {e}");
            connection.close();
            return Err(e);
        }
        Ok(connection)
    }

    async fn handshake(&self) -> Result<()> {
        let timeout = self.inner.options.connect_timeout;
        let result: InitializeResult = self
            .inner
            .request("initialize", Some(InitializeParams::default()), timeout)
            .await?;
        self.inner
            .notify(JsonRpcNotification::new("notifications/initialized"))
            .await?;
        *lock(&self.inner.server_info) = Some(result);

        self.list_tools().await?;

        let became_ready = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Ready;
                true
            } else {
                false
            }
        });
        if !became_ready {
            return Err(Error::ConnectionLost(
                "server went away during handshake".into(),
            ));
        }

        info!(
            server = %self.name(),
            tools = self.tools().len(),
            "capability server ready"
        );
        Ok(())
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Get the configuration this connection was created from.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Get server info (after initialization).
    pub fn server_info(&self) -> Option<InitializeResult> {
        lock(&self.inner.server_info).clone()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Tools discovered by the last `tools/list`.
    pub fn tools(&self) -> Vec<Tool> {
        match self.inner.tools.read() {
            Ok(tools) => tools.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Refresh the list of available tools.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let timeout = self.inner.options.request_timeout;
        let result: ListToolsResult = self
            .inner
            .request("tools/list", None::<()>, timeout)
            .await?;
        match self.inner.tools.write() {
            Ok(mut tools) => *tools = result.tools.clone(),
            Err(poisoned) => *poisoned.into_inner() = result.tools.clone(),
        }
        Ok(result.tools)
    }

    /// Call a tool by name.
    ///
    /// Many calls may be in flight at once. A timeout or protocol error
    /// degrades the connection; a completed round trip restores it. Calls
    /// on a dead connection fail immediately.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments: match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            },
        };

        let outcome: Result<CallToolResult> =
            self.inner.request("tools/call", Some(params), timeout).await;

        match &outcome {
            // The server answered, even if the answer was unusable.
            Ok(_) | Err(Error::TooLarge { .. }) => {
                self.inner.transition(ConnectionState::Degraded, ConnectionState::Ready)
            }
            Err(Error::ConnectionLost(_)) => {}
            Err(e) => {
                debug!(server = %self.name(), tool = name, "call failed: {e}");
                self.inner.transition(ConnectionState::Ready, ConnectionState::Degraded);
            }
        }
        outcome
    }

    /// Shut the connection down. Pending calls fail with "connection lost";
    /// the dead hook does not fire.
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.mark_dead("closed by client");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn request<P, R>(&self, method: &str, params: Option<P>, timeout: Duration) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        if *self.state.borrow() == ConnectionState::Dead {
            return Err(Error::ConnectionLost(format!(
                "server '{}' is not running",
                self.config.name
            )));
        }

        let id = self.next_request_id();
        let params = params.map(serde_json::to_value).transpose()?;
        let request = JsonRpcRequest::new(id.clone(), method, params);
        let line = codec::encode(&Outbound::Request(request))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        // The write counts against the timeout too: a server that stops
        // reading blocks it.
        let value = tokio::time::timeout(timeout, self.exchange(&line, rx))
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        Ok(serde_json::from_value(value)?)
    }

    async fn exchange(&self, line: &[u8], rx: oneshot::Receiver<Result<Value>>) -> Result<Value> {
        self.transport.send(line).await?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionLost("response channel dropped".into())),
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<()> {
        let line = codec::encode(&Outbound::Notification(notification))?;
        self.send_bounded(&line).await
    }

    async fn send_bounded(&self, line: &[u8]) -> Result<()> {
        let timeout = self.options.request_timeout;
        tokio::time::timeout(timeout, self.transport.send(line))
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    async fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Line(line) => self.handle_line(&line).await,
            Frame::Oversized { head, size } => {
                let max = self.options.max_message_size;
                let responder =
                    codec::peek_id(&head).and_then(|id| lock(&self.pending).remove(&id));
                match responder {
                    Some(sender) => {
                        let _ = sender.send(Err(Error::TooLarge { size, max }));
                    }
                    None => warn!(
                        server = %self.config.name,
                        size,
                        "dropping oversized message"
                    ),
                }
            }
        }
    }

    async fn handle_line(&self, line: &[u8]) {
        match codec::decode(line) {
            Ok(Inbound::Response(response)) => {
                let responder = lock(&self.pending).remove(&response.id);
                match responder {
                    Some(sender) => {
                        let _ = sender.send(response.into_result().map_err(Error::from));
                    }
                    None => debug!(
                        server = %self.config.name,
                        id = %response.id,
                        "response for unknown or expired request"
                    ),
                }
            }
            Ok(Inbound::Notification { method, .. }) => {
                debug!(server = %self.config.name, %method, "discarding notification");
            }
            Ok(Inbound::Request { id, method, .. }) => {
                debug!(server = %self.config.name, %method, "rejecting server request");
                let reply = JsonRpcResponse::error(id, JsonRpcError::method_not_found(&method));
                let sent = match codec::encode(&Outbound::Response(reply)) {
                    Ok(line) => self.send_bounded(&line).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = sent {
                    warn!(server = %self.config.name, "failed to answer server request: {e}");
                }
            }
            Err(codec::ParseError::Empty) => {}
            Err(e) => {
                warn!(server = %self.config.name, "ignoring unreadable line: {e}");
            }
        }
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            info!(server = %self.config.name, %from, %to, "connection state changed");
        }
    }

    fn mark_dead(&self, reason: &str) {
        let previous = self.state.send_replace(ConnectionState::Dead);
        if previous == ConnectionState::Dead {
            return;
        }

        let drained: Vec<_> = lock(&self.pending).drain().collect();
        for (_, sender) in drained {
            let _ = sender.send(Err(Error::ConnectionLost(reason.to_string())));
        }
        self.transport.close();

        let intentional = self.closing.load(Ordering::SeqCst);
        if intentional {
            debug!(server = %self.config.name, "connection closed");
            return;
        }
        warn!(server = %self.config.name, %reason, "capability server died");

        if previous != ConnectionState::Connecting {
            let hook = lock(&self.on_dead).take();
            if let Some(hook) = hook {
                hook(reason.to_string());
            }
        }
    }
}

/// Removes a pending entry when the request completes, times out or is
/// dropped, so ids are never answered twice.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

async fn read_loop(inner: Weak<Inner>, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Frame(frame) => inner.handle_frame(frame).await,
            TransportEvent::Closed(reason) => {
                inner.mark_dead(&reason);
                return;
            }
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.mark_dead("transport closed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A capability server written in shell: answers initialize, lists
    /// `commit` and `push`, echoes calls, hangs on `slow` and stops
    /// reading on `stall`.
    pub(crate) const FAKE_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"method":"notification","params":{"msg":"booting"}}\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"id":%s,"result":{"tools":[{"name":"commit","description":"Commit","parameters":{"type":"object"}},{"name":"push","description":"Push"}]}}\n' "$id" ;;
    *'"name":"slow"'*) : ;;
    *'"name":"stall"'*) exec sleep 1000 ;;
    *'"name":"badutf8"'*)
      printf '\377\376 garbage\n'
      printf '{"id":%s,"result":{"output":"survived"}}\n' "$id" ;;
    *'"name":"big"'*)
      printf '{"id":%s,"result":{"output":"%s"}}\n' "$id" "$(head -c 1100000 /dev/zero | tr '\0' x)" ;;
    *'"name":"fail"'*)
      printf '{"id":%s,"error":{"code":-1,"message":"nope"}}\n' "$id" ;;
    *'"name":"exit"'*) exit 0 ;;
    *'"method":"tools/call"'*)
      printf 'garbage line\n'
      printf '{"id":%s,"result":{"output":"done"}}\n' "$id" ;;
  esac
done
"#;

    fn fake_config(name: &str) -> ServerConfig {
        ServerConfig::stdio(name, "sh", ["-c", FAKE_SERVER])
    }

    #[tokio::test]
    async fn connect_lists_tools_and_becomes_ready() {
        let conn = Connection::connect(fake_config("git-tools"), ConnectOptions::default())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        let names: Vec<_> = conn.tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["commit", "push"]);
    }

    #[tokio::test]
    async fn invoke_skips_garbage_and_notifications() {
        let conn = Connection::connect(fake_config("git-tools"), ConnectOptions::default())
            .await
            .unwrap();
        let result = conn
            .invoke("commit", serde_json::json!({"message": "hi"}), DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(result.text(), "done");
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn timeout_degrades_and_success_recovers() {
        let conn = Connection::connect(fake_config("git-tools"), ConnectOptions::default())
            .await
            .unwrap();

        let err = conn
            .invoke("slow", Value::Null, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(conn.state(), ConnectionState::Degraded);
        assert_eq!(conn.tools().len(), 2);

        conn.invoke("commit", Value::Null, DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn rpc_error_degrades() {
        let conn = Connection::connect(fake_config("git-tools"), ConnectOptions::default())
            .await
            .unwrap();
        let err = conn.invoke("fail", Value::Null, DEFAULT_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::JsonRpc(ref e) if e.message == "nope"));
        assert_eq!(conn.state(), ConnectionState::Degraded);
    }

    #[tokio::test]
    async fn concurrent_calls_are_multiplexed() {
        let conn = Connection::connect(fake_config("git-tools"), ConnectOptions::default())
            .await
            .unwrap();
        let (a, b, c) = tokio::join!(
            conn.invoke("commit", Value::Null, DEFAULT_TIMEOUT),
            conn.invoke("push", Value::Null, DEFAULT_TIMEOUT),
            conn.invoke("commit", Value::Null, DEFAULT_TIMEOUT),
        );
        assert_eq!(a.unwrap().text(), "done");
        assert_eq!(b.unwrap().text(), "done");
        assert_eq!(c.unwrap().text(), "done");
    }

    #[tokio::test]
    async fn process_exit_kills_connection_and_fires_hook() {
        let (tx, rx) = oneshot::channel();
        let hook: DeadHook = Box::new(move |reason| {
            let _ = tx.send(reason);
        });
        let conn = Connection::connect_with_hook(
            fake_config("git-tools"),
            ConnectOptions::default(),
            Some(hook),
        )
        .await
        .unwrap();

        let (slow, exit) = tokio::join!(
            conn.invoke("slow", Value::Null, Duration::from_secs(30)),
            conn.invoke("exit", Value::Null, Duration::from_secs(30)),
        );
        assert!(matches!(slow, Err(Error::ConnectionLost(_))));
        assert!(matches!(exit, Err(Error::ConnectionLost(_))));

        let reason = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(!reason.is_empty());
        assert_eq!(conn.state(), ConnectionState::Dead);

        let err = conn.invoke("commit", Value::Null, DEFAULT_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn close_fails_pending_without_hook() {
        let (tx, mut rx) = oneshot::channel::<String>();
        let hook: DeadHook = Box::new(move |reason| {
            let _ = tx.send(reason);
        });
        let conn = Arc::new(
            Connection::connect_with_hook(
                fake_config("git-tools"),
                ConnectOptions::default(),
                Some(hook),
            )
            .await
            .unwrap(),
        );

        let pending = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.invoke("slow", Value::Null, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.close();

        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::ConnectionLost(_))));
        assert_eq!(conn.state(), ConnectionState::Dead);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_skipped() {
        let conn = Connection::connect(fake_config("git-tools"), ConnectOptions::default())
            .await
            .unwrap();
        let result = conn.invoke("badutf8", Value::Null, DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(result.text(), "survived");
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.tools().len(), 2);
    }

    #[tokio::test]
    async fn blocked_write_is_bounded_by_the_call_timeout() {
        let conn = Connection::connect(fake_config("git-tools"), ConnectOptions::default())
            .await
            .unwrap();
        let err = conn
            .invoke("stall", Value::Null, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        // Far larger than a pipe buffer, so the write cannot complete.
        let payload = serde_json::json!({ "blob": "x".repeat(2 * 1024 * 1024) });
        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            conn.invoke("commit", payload, Duration::from_millis(300)),
        )
        .await
        .expect("invoke ignored its timeout");
        assert!(outcome.unwrap_err().is_timeout());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(conn.state(), ConnectionState::Degraded);
    }

    #[tokio::test]
    async fn output_over_one_megabyte_is_delivered() {
        let conn = Connection::connect(fake_config("git-tools"), ConnectOptions::default())
            .await
            .unwrap();
        let result = conn.invoke("big", Value::Null, DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(result.text().len(), 1_100_000);
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn oversized_reply_fails_its_call_promptly() {
        let options = ConnectOptions {
            max_message_size: 4096,
            ..ConnectOptions::default()
        };
        let conn = Connection::connect(fake_config("git-tools"), options).await.unwrap();

        let started = std::time::Instant::now();
        let err = conn.invoke("big", Value::Null, DEFAULT_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::TooLarge { max: 4096, .. }));
        assert!(started.elapsed() < DEFAULT_TIMEOUT);
        assert_eq!(conn.state(), ConnectionState::Ready);

        let result = conn.invoke("commit", Value::Null, DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(result.text(), "done");
    }

    #[tokio::test]
    async fn subscribers_see_the_connection_die() {
        let conn = Connection::connect(fake_config("git-tools"), ConnectOptions::default())
            .await
            .unwrap();
        let mut states = conn.subscribe();
        assert_eq!(*states.borrow(), ConnectionState::Ready);

        let _ = conn.invoke("exit", Value::Null, Duration::from_secs(5)).await;
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|state| *state == ConnectionState::Dead),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn silent_server_times_out_on_connect() {
        let config = ServerConfig::stdio("mute", "sh", ["-c", "sleep 30"]);
        let options = ConnectOptions {
            connect_timeout: Duration::from_millis(200),
            ..ConnectOptions::default()
        };
        let err = Connection::connect(config, options).await.unwrap_err();
        assert!(err.is_timeout());
    }

    /// A minimal HTTP+SSE capability server on a local port. Answers the
    /// handshake, lists `search`, and drops the event stream on `hangup`.
    mod sse {
        use std::sync::Arc;

        use serde_json::{Value, json};
        use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
        use tokio::net::{TcpListener, TcpStream};
        use tokio::sync::{Mutex, mpsc};

        type Stream = mpsc::UnboundedSender<Option<String>>;

        pub async fn serve(announce: bool) -> String {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (tx, rx) = mpsc::unbounded_channel();
            let rx = Arc::new(Mutex::new(Some(rx)));
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    tokio::spawn(handle(socket, tx.clone(), Arc::clone(&rx), announce));
                }
            });
            format!("http://{addr}/sse")
        }

        async fn read_request(reader: &mut BufReader<TcpStream>) -> Option<(String, Vec<u8>)> {
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).await.ok()? == 0 {
                return None;
            }
            let method = request_line.split_whitespace().next()?.to_string();
            let mut length = 0;
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).await.ok()?;
                let header = header.trim_end();
                if header.is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':')
                    && name.eq_ignore_ascii_case("content-length")
                {
                    length = value.trim().parse().ok()?;
                }
            }
            let mut body = vec![0; length];
            reader.read_exact(&mut body).await.ok()?;
            Some((method, body))
        }

        async fn handle(
            socket: TcpStream,
            stream: Stream,
            events: Arc<Mutex<Option<mpsc::UnboundedReceiver<Option<String>>>>>,
            announce: bool,
        ) {
            let mut reader = BufReader::new(socket);
            while let Some((method, body)) = read_request(&mut reader).await {
                let socket = reader.get_mut();
                if method == "GET" {
                    let Some(mut events) = events.lock().await.take() else {
                        return;
                    };
                    let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\
                                cache-control: no-cache\r\nconnection: close\r\n\r\n";
                    let _ = socket.write_all(head.as_bytes()).await;
                    if announce {
                        let _ = socket.write_all(b"event: endpoint\ndata: /messages?session=1\n\n").await;
                    }
                    while let Some(Some(frame)) = events.recv().await {
                        let _ = socket.write_all(frame.as_bytes()).await;
                    }
                    let _ = socket.shutdown().await;
                    return;
                }

                let _ = socket
                    .write_all(b"HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\n\r\n")
                    .await;
                let Ok(request) = serde_json::from_slice::<Value>(&body) else {
                    continue;
                };
                let Some(id) = request.get("id").cloned() else {
                    continue;
                };
                let result = match request["method"].as_str() {
                    Some("initialize") => json!({"protocolVersion": "2024-11-05", "capabilities": {}}),
                    Some("tools/list") => json!({"tools": [{"name": "search", "description": "Search"}]}),
                    Some("tools/call") if request["params"]["name"] == "hangup" => {
                        let _ = stream.send(None);
                        continue;
                    }
                    Some("tools/call") => {
                        let query = request["params"]["arguments"]["query"].as_str().unwrap_or("");
                        json!({"content": [{"type": "text", "text": format!("found {query}")}]})
                    }
                    _ => continue,
                };
                let reply = json!({"jsonrpc": "2.0", "id": id, "result": result});
                let _ = stream.send(Some(format!("event: message\ndata: {reply}\n\n")));
            }
        }
    }

    #[tokio::test]
    async fn sse_server_handshake_call_and_close() {
        let url = sse::serve(true).await;
        let (tx, rx) = oneshot::channel();
        let hook: DeadHook = Box::new(move |reason| {
            let _ = tx.send(reason);
        });
        let conn = Connection::connect_with_hook(
            ServerConfig::sse("search", url),
            ConnectOptions::default(),
            Some(hook),
        )
        .await
        .unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.tools()[0].name, "search");

        let result = conn
            .invoke("search", serde_json::json!({"query": "rust"}), DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(result.text(), "found rust");

        let err = conn
            .invoke("hangup", Value::Null, DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionLost(_)));
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Dead);
    }

    #[tokio::test]
    async fn sse_server_without_endpoint_times_out() {
        let url = sse::serve(false).await;
        let options = ConnectOptions {
            connect_timeout: Duration::from_millis(300),
            ..ConnectOptions::default()
        };
        let started = std::time::Instant::now();
        let err = Connection::connect(ServerConfig::sse("search", url), options)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let config = ServerConfig::stdio("ghost", "/nonexistent/capability-server", Vec::<String>::new());
        let err = Connection::connect(config, ConnectOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
    }
}
