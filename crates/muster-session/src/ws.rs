//! WebSocket transport
//!
//! Frames are binary WebSocket messages carrying one encoded value document
//! each. The listener accepts inbound sessions; [`WsConnector`] dials
//! outbound ones (`ws://host:port`).

use crate::endpoint::{Endpoint, SessionConnector};
use crate::error::{SessionError, SessionResult};
use crate::session::{Session, SessionTransport};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use muster_primitives::ProcessType;
use muster_runtime::Shutdownable;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Transport backed by a WebSocket write queue.
struct WsTransport {
    frames: mpsc::UnboundedSender<Option<Bytes>>,
}

impl SessionTransport for WsTransport {
    fn send(&self, frame: Bytes) {
        let _ = self.frames.send(Some(frame));
    }

    fn close(&self) {
        let _ = self.frames.send(None);
    }
}

/// Bind a listener and accept inbound sessions until the endpoint shuts
/// down. Returns the bound port.
pub async fn listen(endpoint: Arc<Endpoint>, port: u16) -> SessionResult<u16> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let port = listener.local_addr()?.port();
    debug!(port, "endpoint listening");

    tokio::spawn(async move {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(%error, "accept failed");
                    continue;
                }
            };
            debug!(%addr, "incoming connection");
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let websocket = match tokio_tungstenite::accept_async(stream).await {
                    Ok(websocket) => websocket,
                    Err(error) => {
                        return warn!(%error, "websocket accept failed");
                    }
                };
                let session = Session::new(
                    endpoint.runtime().clone(),
                    Arc::downgrade(&endpoint),
                    endpoint.metrics().clone(),
                );
                endpoint.add_session(session.clone());
                attach_plain(session.clone(), websocket);
                // the accepting daemon opens the handshake exchange
                if endpoint.runtime().process_type() == ProcessType::Daemon {
                    session.send_handshake();
                }
            });
        }
    });

    Ok(port)
}

/// Outbound connector dialing `ws://host:port`.
pub struct WsConnector;

impl SessionConnector for WsConnector {
    fn connect(&self, endpoint: &Arc<Endpoint>, url: &str) -> Option<Arc<Session>> {
        if !url.starts_with("ws://") || url.rfind(':').map(|i| i < 5).unwrap_or(true) {
            warn!(url, "invalid session url");
            return None;
        }
        let session = Session::new(
            endpoint.runtime().clone(),
            Arc::downgrade(endpoint),
            endpoint.metrics().clone(),
        );
        endpoint.add_session(session.clone());

        let url = url.to_owned();
        let dialing = session.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((websocket, _)) => {
                    attach_tls(dialing, websocket);
                }
                Err(error) => {
                    warn!(url, %error, "connect failed");
                    dialing.shutdown().await;
                }
            }
        });
        Some(session)
    }
}

fn attach_plain(session: Arc<Session>, websocket: WebSocketStream<TcpStream>) {
    let (sink, stream) = websocket.split();
    spawn_pumps(session, sink, stream);
}

fn attach_tls(session: Arc<Session>, websocket: WebSocketStream<MaybeTlsStream<TcpStream>>) {
    let (sink, stream) = websocket.split();
    spawn_pumps(session, sink, stream);
}

fn spawn_pumps<S>(
    session: Arc<Session>,
    mut sink: futures_util::stream::SplitSink<WebSocketStream<S>, WsMessage>,
    mut stream: futures_util::stream::SplitStream<WebSocketStream<S>>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Option<Bytes>>();
    session.set_transport(Arc::new(WsTransport { frames: frames_tx }));

    // writer: drain the frame queue into the socket
    tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            match frame {
                Some(data) => {
                    if sink.send(WsMessage::Binary(data.to_vec())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    // reader: feed received frames into the session strand
    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(WsMessage::Binary(data)) => {
                    session.handle_frame(Bytes::from(data));
                }
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        debug!(peer = %session.process_id(), "connection closed");
        session.shutdown().await;
    });
}

/// Validate and split a `ws://host:port` URL.
pub fn parse_ws_url(url: &str) -> SessionResult<(String, String)> {
    let rest = url
        .strip_prefix("ws://")
        .ok_or_else(|| SessionError::InvalidUrl(url.to_owned()))?;
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| SessionError::InvalidUrl(url.to_owned()))?;
    if host.is_empty() || port.is_empty() {
        return Err(SessionError::InvalidUrl(url.to_owned()));
    }
    Ok((host.to_owned(), port.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ws_url() {
        let (host, port) = parse_ws_url("ws://battle.example:9000").unwrap();
        assert_eq!(host, "battle.example");
        assert_eq!(port, "9000");
    }

    #[test]
    fn test_parse_ws_url_rejects_garbage() {
        assert!(parse_ws_url("http://x:1").is_err());
        assert!(parse_ws_url("ws://nohost").is_err());
        assert!(parse_ws_url("ws://:1").is_err());
    }
}
