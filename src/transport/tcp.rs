//! Newline-delimited JSON over TCP.

use super::{AcceptSender, Connector, Link};
use crate::error::{AppResult, DaqError};
use crate::protocol::Event;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

/// Longest line a peer may send before it is disconnected.
pub const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// Wraps a connected stream into a [`Link`].
///
/// A reader task decodes one event per line and a writer task encodes one
/// event per line. Undecodable lines are logged and skipped; a line over
/// [`MAX_LINE_LENGTH`] closes the connection.
pub fn spawn_connection(stream: TcpStream) -> Link {
    spawn_connection_with_limit(stream, MAX_LINE_LENGTH)
}

/// [`spawn_connection`] with a custom line length limit.
pub fn spawn_connection_with_limit(stream: TcpStream, max_line_length: usize) -> Link {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Event>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Event>();

    let reader_peer = peer.clone();
    tokio::spawn(async move {
        let mut lines =
            FramedRead::new(read_half, LinesCodec::new_with_max_length(max_line_length));
        while let Some(next) = lines.next().await {
            match next {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => match Event::from_line(&line) {
                    Ok(event) => {
                        if in_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(peer = %reader_peer, error = %e, "dropping undecodable line"),
                },
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(peer = %reader_peer, max_line_length, "line too long, disconnecting");
                    break;
                }
                Err(LinesCodecError::Io(e)) => {
                    debug!(peer = %reader_peer, error = %e, "read failed");
                    break;
                }
            }
        }
        debug!(peer = %reader_peer, "reader finished");
    });

    tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let mut line = match event.to_line() {
                Ok(line) => line,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "dropping unencodable event");
                    continue;
                }
            };
            line.push('\n');
            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                debug!(peer = %peer, error = %e, "write failed");
                break;
            }
        }
        let _ = write_half.shutdown().await;
        debug!(peer = %peer, "writer finished");
    });

    Link {
        outbound: out_tx,
        inbound: in_rx,
    }
}

/// Accepts connections until the server stops draining `accept`.
pub async fn accept_loop(listener: TcpListener, accept: AcceptSender) -> AppResult<()> {
    info!(addr = %listener.local_addr()?, "event bus listening");
    loop {
        let (stream, addr) = listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!(%addr, error = %e, "failed to disable Nagle");
        }
        debug!(%addr, "accepted connection");
        if accept.send(spawn_connection(stream)).is_err() {
            return Ok(());
        }
    }
}

/// Connects to a server's event bus over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Connector for `host:port`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> AppResult<Link> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| DaqError::Transport(format!("connect to {} failed: {e}", self.addr)))?;
        stream.set_nodelay(true)?;
        Ok(spawn_connection(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::StepId;

    #[tokio::test]
    async fn events_cross_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (accept_tx, mut accept_rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_loop(listener, accept_tx));

        let mut client = TcpConnector::new(addr).connect().await.unwrap();
        let mut server = accept_rx.recv().await.unwrap();

        client.outbound.send(Event::IsStepReady(StepId(9))).unwrap();
        assert_eq!(server.inbound.recv().await, Some(Event::IsStepReady(StepId(9))));

        server.outbound.send(Event::StepReadyForMeasurement(StepId(9))).unwrap();
        assert_eq!(
            client.inbound.recv().await,
            Some(Event::StepReadyForMeasurement(StepId(9)))
        );

        drop(client.outbound);
        assert_eq!(server.inbound.recv().await, None);
    }

    #[tokio::test]
    async fn oversized_line_closes_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut raw = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut server = spawn_connection_with_limit(stream, 64);

        let mut payload = Event::IsStepReady(StepId(3)).to_line().unwrap();
        payload.push('\n');
        // no newline ever comes
        payload.push_str(&"x".repeat(10_000));
        raw.write_all(payload.as_bytes()).await.unwrap();

        assert_eq!(server.inbound.recv().await, Some(Event::IsStepReady(StepId(3))));
        let closed = tokio::time::timeout(std::time::Duration::from_secs(5), server.inbound.recv())
            .await
            .unwrap();
        assert_eq!(closed, None);
        drop(raw);
    }
}
