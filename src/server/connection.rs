//! Per-connection request loop

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::config::ServerConfig;
use super::protocol::{dispatch, ControlRequest, ControlResponse};
use crate::error::{Error, Result};
use crate::router::MessageRouter;

/// One Control API client connection
pub struct Connection {
    session_id: u64,
    peer_addr: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    config: ServerConfig,
    router: Arc<MessageRouter>,
    requests: u64,
}

impl Connection {
    pub fn new(
        session_id: u64,
        socket: TcpStream,
        peer_addr: SocketAddr,
        config: ServerConfig,
        router: Arc<MessageRouter>,
    ) -> Self {
        let (read_half, write_half) = socket.into_split();

        Self {
            session_id,
            peer_addr,
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            config,
            router,
            requests: 0,
        }
    }

    /// Serve requests until the peer disconnects or goes idle
    pub async fn run(&mut self) -> Result<()> {
        let mut line = Vec::with_capacity(1024);

        loop {
            line.clear();
            let limit = self.config.max_line_length as u64 + 1;

            let read = tokio::time::timeout(
                self.config.idle_timeout,
                (&mut self.reader).take(limit).read_until(b'\n', &mut line),
            )
            .await;

            let n = match read {
                Ok(result) => result?,
                Err(_) => {
                    tracing::debug!(session_id = self.session_id, "Idle timeout");
                    return Ok(());
                }
            };

            if n == 0 {
                tracing::debug!(
                    session_id = self.session_id,
                    peer = %self.peer_addr,
                    requests = self.requests,
                    "Peer closed connection"
                );
                return Ok(());
            }

            if line.last() != Some(&b'\n') && line.len() > self.config.max_line_length {
                let err = Error::invalid(format!(
                    "request line exceeds {} bytes",
                    self.config.max_line_length
                ));
                self.respond(&ControlResponse::failure(&err)).await?;
                return Err(err);
            }

            let text = line.trim_ascii();
            if text.is_empty() {
                continue;
            }

            let response = self.handle_line(text).await;
            self.respond(&response).await?;
        }
    }

    async fn handle_line(&mut self, line: &[u8]) -> ControlResponse {
        self.requests += 1;

        let request = match ControlRequest::decode(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(session_id = self.session_id, error = %e, "Malformed request");
                return ControlResponse::failure(&e);
            }
        };

        let method = request.method();
        let result = dispatch(&self.router, request).await;

        match &result {
            Ok(_) => tracing::trace!(session_id = self.session_id, method = method, "Request handled"),
            Err(e) => tracing::debug!(
                session_id = self.session_id,
                method = method,
                code = e.code(),
                error = %e,
                "Request failed"
            ),
        }

        ControlResponse::from(result)
    }

    async fn respond(&mut self, response: &ControlResponse) -> Result<()> {
        let mut bytes = serde_json::to_vec(response)?;
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
