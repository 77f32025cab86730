//! Length-prefixed JSON frames over TCP.
//!
//! URLs take the form `tcp://host:port`. `create` returns immediately with a
//! socket in the `Connecting` state; a spawned task connects (bounded by the
//! connect timeout), then runs the writer loop while a second task reads
//! frames.

use super::frame::{read_frame, write_frame};
use super::socket::{
    CloseEvent, ReadyState, Socket, SocketConnection, SocketEvent, SocketFactory, SocketState,
};
use crate::config::TransportDefaults;
use crate::error::{EnigmaError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

/// Socket factory for `tcp://` URLs.
#[derive(Debug, Clone)]
pub struct TcpSocketFactory {
    connect_timeout: Duration,
}

impl Default for TcpSocketFactory {
    fn default() -> Self {
        Self {
            connect_timeout: TransportDefaults::CONNECT_TIMEOUT,
        }
    }
}

impl TcpSocketFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Extract `host:port` from a `tcp://` URL.
fn socket_addr(raw: &str) -> Result<String> {
    let url = Url::parse(raw).map_err(|e| EnigmaError::Config {
        message: format!("Invalid URL {}: {}", raw, e),
    })?;
    if url.scheme() != TransportDefaults::TCP_SCHEME {
        return Err(EnigmaError::Config {
            message: format!("Unsupported scheme '{}' in {}", url.scheme(), raw),
        });
    }
    let host = url.host_str().ok_or_else(|| EnigmaError::Config {
        message: format!("Missing host in {}", raw),
    })?;
    let port = url.port().ok_or_else(|| EnigmaError::Config {
        message: format!("Missing port in {}", raw),
    })?;
    Ok(format!("{}:{}", host, port))
}

impl SocketFactory for TcpSocketFactory {
    fn create(&self, url: &str) -> Result<SocketConnection> {
        let addr = socket_addr(url)?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let socket = Arc::new(TcpSocket {
            state: SocketState::new(ReadyState::Connecting),
            outbound,
            events,
        });
        tokio::spawn(run_connection(
            addr,
            self.connect_timeout,
            socket.clone(),
            outbound_rx,
        ));

        Ok(SocketConnection {
            socket,
            events: events_rx,
        })
    }
}

enum Outbound {
    Text(String),
    Close,
}

struct TcpSocket {
    state: SocketState,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl TcpSocket {
    fn finish(&self, event: CloseEvent) {
        if self.state.mark_closed() {
            debug!("TCP socket closed ({} {})", event.code, event.reason);
            let _ = self.events.send(SocketEvent::Closed(event));
        }
    }

    fn fail(&self, reason: String) {
        if self.state.get() == ReadyState::Closed {
            return;
        }
        let _ = self.events.send(SocketEvent::Error(reason.clone()));
        self.finish(CloseEvent::abnormal(reason));
    }
}

impl Socket for TcpSocket {
    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    fn send(&self, text: String) -> Result<()> {
        if self.ready_state() != ReadyState::Open {
            return Err(EnigmaError::not_connected("Socket is not open"));
        }
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| EnigmaError::not_connected("Connection task has stopped"))
    }

    fn close(&self, code: u16, reason: &str) {
        if self.state.get() == ReadyState::Closed {
            return;
        }
        self.state.set(ReadyState::Closing);
        let _ = self.outbound.send(Outbound::Close);
        self.finish(CloseEvent::new(code, reason));
    }
}

async fn run_connection(
    addr: String,
    connect_timeout: Duration,
    socket: Arc<TcpSocket>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            socket.fail(format!("Failed to connect to {}: {}", addr, e));
            return;
        }
        Err(_) => {
            socket.fail(EnigmaError::Timeout(connect_timeout).to_string());
            return;
        }
    };

    // Closed while connecting.
    if socket.state.get() != ReadyState::Connecting {
        return;
    }
    socket.state.set(ReadyState::Open);
    let _ = socket.events.send(SocketEvent::Opened);
    debug!("TCP socket connected to {}", addr);

    let (mut reader, mut writer) = stream.into_split();

    let read_socket = socket.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(payload)) => match String::from_utf8(payload) {
                    Ok(text) => {
                        let _ = read_socket.events.send(SocketEvent::Message(text));
                    }
                    Err(e) => warn!("Dropping non UTF-8 frame: {}", e),
                },
                Ok(None) => {
                    read_socket.finish(CloseEvent::abnormal("Connection closed by peer"));
                    break;
                }
                Err(e) => {
                    read_socket.fail(e.to_string());
                    break;
                }
            }
        }
    });

    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Text(text) => {
                if let Err(e) = write_frame(&mut writer, text.as_bytes()).await {
                    socket.fail(e.to_string());
                    break;
                }
            }
            Outbound::Close => break,
        }
    }

    let _ = writer.shutdown().await;
    reader_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_socket_addr_parsing() {
        assert_eq!(socket_addr("tcp://127.0.0.1:4848").unwrap(), "127.0.0.1:4848");
        assert!(matches!(
            socket_addr("ws://127.0.0.1:4848"),
            Err(EnigmaError::Config { .. })
        ));
        assert!(socket_addr("tcp://127.0.0.1").is_err());
        assert!(socket_addr("not a url").is_err());
    }

    #[tokio::test]
    async fn test_exchange_frames_with_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_frame(&mut stream).await.unwrap().unwrap();
            let request: serde_json::Value = serde_json::from_slice(&request).unwrap();
            let response = serde_json::json!({"jsonrpc": "2.0", "id": request["id"], "result": {}});
            write_frame(&mut stream, response.to_string().as_bytes())
                .await
                .unwrap();
            stream
        });

        let SocketConnection { socket, mut events } = TcpSocketFactory::new()
            .create(&format!("tcp://127.0.0.1:{}", port))
            .unwrap();
        assert_eq!(events.recv().await, Some(SocketEvent::Opened));
        assert_eq!(socket.ready_state(), ReadyState::Open);

        socket.send(r#"{"jsonrpc":"2.0","id":1,"method":"Ping","handle":-1,"params":[]}"#.to_string()).unwrap();
        match events.recv().await {
            Some(SocketEvent::Message(text)) => assert!(text.contains("\"id\":1")),
            other => panic!("unexpected event: {other:?}"),
        }

        let _stream = server.await.unwrap();
        socket.close(1000, "done");
        assert_eq!(
            events.recv().await,
            Some(SocketEvent::Closed(CloseEvent::new(1000, "done")))
        );
        assert_eq!(socket.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error_then_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let SocketConnection { mut events, .. } = TcpSocketFactory::new()
            .create(&format!("tcp://127.0.0.1:{}", port))
            .unwrap();
        assert!(matches!(events.recv().await, Some(SocketEvent::Error(_))));
        match events.recv().await {
            Some(SocketEvent::Closed(event)) => assert_eq!(event.code, 1006),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
