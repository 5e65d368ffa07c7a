//! Control API client
//!
//! Speaks the JSON-lines protocol of [`ControlServer`](super::ControlServer).
//! One request in flight at a time per client.

use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use super::protocol::{ControlRequest, ControlResponse};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::registry::{RegisterServiceRequest, ServiceId, ServiceSummary};
use crate::router::RouteSummary;

/// Connected Control API client
pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true)?;
        let (read_half, writer) = socket.into_split();

        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    /// Send one request and wait for its response line
    pub async fn call(&mut self, request: &ControlRequest) -> Result<ControlResponse> {
        let mut bytes = serde_json::to_vec(request)?;
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed connection",
            )));
        }

        Ok(serde_json::from_str(&line)?)
    }

    async fn call_typed<T: DeserializeOwned>(&mut self, request: ControlRequest) -> Result<T> {
        let value = self.call(&request).await?.into_result()?;
        Ok(serde_json::from_value(value)?)
    }

    async fn call_unit(&mut self, request: ControlRequest) -> Result<()> {
        self.call(&request).await?.into_result().map(|_| ())
    }

    pub async fn register_service(&mut self, request: RegisterServiceRequest) -> Result<ServiceSummary> {
        self.call_typed(ControlRequest::RegisterService(request)).await
    }

    pub async fn unregister_service(&mut self, service_uuid: ServiceId) -> Result<()> {
        self.call_unit(ControlRequest::UnregisterService { service_uuid })
            .await
    }

    pub async fn start_handling(&mut self, service_uuid: ServiceId) -> Result<()> {
        self.call_unit(ControlRequest::StartHandling { service_uuid }).await
    }

    pub async fn stop_handling(&mut self, service_uuid: ServiceId) -> Result<()> {
        self.call_unit(ControlRequest::StopHandling { service_uuid }).await
    }

    pub async fn publish(
        &mut self,
        service_uuid: ServiceId,
        routing_key: impl Into<String>,
        payload: Envelope,
    ) -> Result<()> {
        self.call_unit(ControlRequest::Publish {
            service_uuid,
            routing_key: routing_key.into(),
            payload,
        })
        .await
    }

    pub async fn list_services(&mut self) -> Result<Vec<ServiceSummary>> {
        self.call_typed(ControlRequest::ListServices).await
    }

    pub async fn list_routes(&mut self) -> Result<Vec<RouteSummary>> {
        self.call_typed(ControlRequest::ListRoutes).await
    }
}
