//! WebSocket transport — server and client connections.
//!
//! A node serves `ws://<listen_addr>/<its-peer-id>`. The caller names itself
//! in the `x-peer-id` request header. A request for any other path is
//! answered with 404, so dialling a peer id that is not served at the
//! resolved address fails during the HTTP upgrade.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async, connect_async};
use tracing::{debug, error, info, warn};

use super::{Connection, Direction, OUTBOUND_BUFFER, Outgoing, Transport, TransportEvent};
use crate::directory::PeerDirectory;
use crate::error::NetworkError;
use crate::identity::PeerId;

/// Request header naming the connecting peer.
pub const PEER_ID_HEADER: &str = "x-peer-id";

/// WebSocket implementation of [`Transport`].
pub struct WsTransport {
    local: PeerId,
    listen_addr: SocketAddr,
    directory: Arc<PeerDirectory>,
    events: mpsc::Sender<TransportEvent>,
    bound: Mutex<Option<SocketAddr>>,
}

impl WsTransport {
    pub fn new(
        local: PeerId,
        listen_addr: SocketAddr,
        directory: Arc<PeerDirectory>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self {
            local,
            listen_addr,
            directory,
            events,
            bound: Mutex::new(None),
        }
    }

    async fn accept(
        stream: TcpStream,
        remote: SocketAddr,
        local: PeerId,
        events: mpsc::Sender<TransportEvent>,
    ) {
        let mut caller: Option<PeerId> = None;
        let check = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let target = req.uri().path().trim_start_matches('/');
            if target != local.as_str() {
                debug!("Rejecting {remote}: requested unknown peer {target:?}");
                return Err(reject(StatusCode::NOT_FOUND, "unknown peer"));
            }
            let claimed = req
                .headers()
                .get(PEER_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| PeerId::parse(v).ok());
            match claimed {
                Some(peer) => {
                    caller = Some(peer);
                    Ok(resp)
                }
                None => Err(reject(StatusCode::BAD_REQUEST, "missing or invalid x-peer-id")),
            }
        };

        let ws = match accept_hdr_async(stream, check).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("WebSocket accept failed for {remote}: {e}");
                return;
            }
        };
        let Some(peer) = caller else {
            return;
        };

        info!("Inbound connection from {peer} ({remote})");
        let conn = spawn_connection(ws, peer, Direction::Inbound, events.clone());
        let _ = events.send(TransportEvent::Opened(conn)).await;
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), NetworkError> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        let addr = listener.local_addr()?;
        *self.bound.lock() = Some(addr);
        info!("WebSocket server listening on {addr}");

        let local = self.local.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            tokio::spawn(Self::accept(stream, remote, local.clone(), events.clone()));
                        }
                        Err(e) => error!("TCP accept failed: {e}"),
                    },
                    _ = shutdown.recv() => {
                        info!("WebSocket server shutting down");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    async fn connect(&self, peer: &PeerId) -> Result<Connection, NetworkError> {
        let addr = self
            .directory
            .resolve(peer)
            .ok_or_else(|| NetworkError::PeerUnavailable(peer.clone()))?;

        let mut request = format!("ws://{addr}/{peer}")
            .into_client_request()
            .map_err(|e| NetworkError::Transport(format!("Bad request for {peer}: {e}")))?;
        let header = HeaderValue::from_str(self.local.as_str())
            .map_err(|e| NetworkError::Transport(format!("Bad local peer id: {e}")))?;
        request.headers_mut().insert(PEER_ID_HEADER, header);

        let (ws, _) = connect_async(request).await.map_err(|e| match e {
            tungstenite::Error::Http(resp) if resp.status() == StatusCode::NOT_FOUND => {
                NetworkError::PeerUnavailable(peer.clone())
            }
            other => NetworkError::Transport(format!("Connect to {peer} at {addr} failed: {other}")),
        })?;

        debug!("Outbound connection to {peer} ({addr}) open");
        let conn = spawn_connection(ws, peer.clone(), Direction::Outbound, self.events.clone());
        let _ = self.events.send(TransportEvent::Opened(conn.clone())).await;
        Ok(conn)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = status;
    resp
}

/// Split the socket into a writer task fed by the connection handle and a
/// reader task that forwards frames as transport events.
fn spawn_connection<S>(
    ws: WebSocketStream<S>,
    peer: PeerId,
    direction: Direction,
    events: mpsc::Sender<TransportEvent>,
) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::channel(OUTBOUND_BUFFER);
    let open = Arc::new(AtomicBool::new(true));
    let conn = Connection::new(peer.clone(), direction, tx.clone(), Arc::clone(&open));
    let id = conn.id();

    let writer_open = Arc::clone(&open);
    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outgoing::Text(text) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!("{id} write failed: {e}");
                        break;
                    }
                }
                Outgoing::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        writer_open.store(false, Ordering::Release);
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    let event = TransportEvent::Data {
                        peer: peer.clone(),
                        connection: id,
                        text: text.as_str().to_owned(),
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("{peer} closed {id}");
                    break;
                }
                Ok(Message::Binary(_)) => warn!("Ignoring binary frame from {peer}"),
                Ok(_) => {} // ping/pong
                Err(e) => {
                    debug!("Read error on {id} from {peer}: {e}");
                    break;
                }
            }
        }
        open.store(false, Ordering::Release);
        let _ = tx.try_send(Outgoing::Close);
        let _ = events
            .send(TransportEvent::Closed {
                peer,
                connection: id,
            })
            .await;
    });

    conn
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn served(name: &str) -> (WsTransport, mpsc::Receiver<TransportEvent>, broadcast::Sender<()>) {
        let (tx, rx) = mpsc::channel(32);
        let transport = WsTransport::new(
            PeerId::from_string(name),
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(PeerDirectory::new()),
            tx,
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        transport.start(shutdown_rx).await.unwrap();
        (transport, rx, shutdown_tx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let (bob, mut bob_rx, _bob_stop) = served("bob").await;
        let (alice, mut alice_rx, _alice_stop) = served("alice").await;
        alice
            .directory
            .insert_static(PeerId::from_string("bob"), bob.local_addr().unwrap());

        let conn = alice.connect(&PeerId::from_string("bob")).await.unwrap();
        assert_eq!(conn.direction(), Direction::Outbound);
        assert!(matches!(next_event(&mut alice_rx).await, TransportEvent::Opened(_)));

        let inbound = match next_event(&mut bob_rx).await {
            TransportEvent::Opened(c) => c,
            other => panic!("expected Opened, got {other:?}"),
        };
        assert_eq!(inbound.peer().as_str(), "alice");
        assert_eq!(inbound.direction(), Direction::Inbound);

        conn.send_text("ping".into()).await.unwrap();
        match next_event(&mut bob_rx).await {
            TransportEvent::Data { peer, text, .. } => {
                assert_eq!(peer.as_str(), "alice");
                assert_eq!(text, "ping");
            }
            other => panic!("expected Data, got {other:?}"),
        }

        conn.close();
        assert!(matches!(next_event(&mut bob_rx).await, TransportEvent::Closed { .. }));
    }

    #[tokio::test]
    async fn test_wrong_target_is_unavailable() {
        let (bob, _bob_rx, _bob_stop) = served("bob").await;
        let (alice, _alice_rx, _alice_stop) = served("alice").await;
        let carol = PeerId::from_string("carol");
        alice.directory.insert_static(carol.clone(), bob.local_addr().unwrap());

        let err = alice.connect(&carol).await.unwrap_err();
        assert!(matches!(err, NetworkError::PeerUnavailable(p) if p == carol));
    }

    #[tokio::test]
    async fn test_unknown_peer_has_no_address() {
        let (alice, _rx, _stop) = served("alice").await;
        let err = alice.connect(&PeerId::from_string("ghost")).await.unwrap_err();
        assert!(matches!(err, NetworkError::PeerUnavailable(_)));
    }
}
