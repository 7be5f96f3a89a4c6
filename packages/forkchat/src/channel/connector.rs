use std::future::Future;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::error::TransportError;

/// Opens persistent text connections.
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    fn connect(&self, url: &str) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;
}

/// One open bidirectional text connection.
///
/// `recv` must be cancel safe: it is raced against outbound commands.
pub trait Connection: Send + 'static {
    /// Next text frame, or `None` once the peer has closed.
    fn recv(&mut self) -> impl Future<Output = Option<Result<String, TransportError>>> + Send;

    fn send(&mut self, text: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    type Conn = WsConnection;

    async fn connect(&self, url: &str) -> Result<WsConnection, TransportError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(TransportError::from_tungstenite)?;
        Ok(WsConnection { stream })
    }
}

pub struct WsConnection {
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

impl Connection for WsConnection {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(tungstenite::Message::Close(_)) => return None,
                // Ping/pong are answered by tungstenite; binary frames are not part of the protocol
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::from_tungstenite(e))),
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(tungstenite::Message::Text(text.into()))
            .await
            .map_err(TransportError::from_tungstenite)
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
