//! Native WebSocket push transport using tokio-tungstenite.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{ConnectInit, PushConnection, TransportEvents, TransportFactory};

const LAST_EVENT_ID: &str = "last-event-id";

/// Opens one WebSocket per connection attempt. Must be used from within a
/// tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

impl TransportFactory for WebSocketTransport {
    fn connect(
        &self,
        url: &str,
        init: ConnectInit,
        events: TransportEvents,
    ) -> Box<dyn PushConnection> {
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(run_connection(url.to_string(), init, events, close_rx));
        Box::new(WebSocketConnection {
            close_tx: Some(close_tx),
            task,
        })
    }
}

struct WebSocketConnection {
    close_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PushConnection for WebSocketConnection {
    fn close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            if tx.send(()).is_ok() {
                return;
            }
        }
        // receiver gone: the connection task already finished
        self.task.abort();
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        if self.close_tx.is_some() {
            self.task.abort();
        }
    }
}

fn build_request(url: &str, init: &ConnectInit) -> Result<Request, String> {
    let mut request = url
        .into_client_request()
        .map_err(|e| format!("invalid push request: {}", e))?;
    let headers = request.headers_mut();

    if let Some(token) = &init.auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| format!("invalid auth token header: {}", e))?;
        headers.insert(header::AUTHORIZATION, value);
    }
    if let Some(last_event_id) = &init.last_event_id {
        let value = HeaderValue::from_str(last_event_id)
            .map_err(|e| format!("invalid last-event-id header: {}", e))?;
        headers.insert(LAST_EVENT_ID, value);
    }
    Ok(request)
}

/// Drive a single connection until it fails, the server closes it, or the
/// hub asks for it to be closed. Reconnecting is the hub's job.
async fn run_connection(
    url: String,
    init: ConnectInit,
    events: TransportEvents,
    mut close_rx: oneshot::Receiver<()>,
) {
    let request = match build_request(&url, &init) {
        Ok(request) => request,
        Err(reason) => {
            events.failed(&reason);
            return;
        }
    };

    let ws_stream = tokio::select! {
        _ = &mut close_rx => return,
        result = connect_async(request) => match result {
            Ok((ws_stream, _response)) => ws_stream,
            Err(e) => {
                tracing::debug!(generation = events.generation(), error = %e, "websocket connect failed");
                events.failed(&e.to_string());
                return;
            }
        },
    };

    tracing::debug!(generation = events.generation(), url = %url, "websocket connected");
    events.opened();

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = &mut close_rx => {
                if let Err(e) = write.send(Message::Close(None)).await {
                    tracing::debug!(error = %e, "close frame not delivered");
                }
                break;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => events.message(text.as_str()),
                Some(Ok(Message::Close(_))) | None => {
                    events.closed();
                    break;
                }
                Some(Ok(_)) => {
                    // Ping/pong are answered by tungstenite; binary frames are not part of the protocol
                }
                Some(Err(e)) => {
                    events.failed(&e.to_string());
                    break;
                }
            },
        }
    }
}
