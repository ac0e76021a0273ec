//! Control client used by the command line front end

use crate::control::api::{Action, ApiRequest, ApiResponse};
use crate::error::{GuardError, Result};
use crate::lifecycle::{CreateTunnel, NewPeer, NewPeerResult};
use crate::wireguard::Tunnel;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Connection to a control server
pub struct ControlClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl ControlClient {
    /// Connect to the server at `addr`
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            GuardError::Infrastructure(format!("Failed to connect to {}: {}", addr, e))
        })?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
            next_id: 1,
        })
    }

    /// Create a tunnel
    pub async fn create_tunnel(&mut self, req: CreateTunnel) -> Result<Tunnel> {
        self.call(Action::CreateTunnel(req)).await
    }

    /// Delete a tunnel
    pub async fn delete_tunnel(&mut self, id: &str) -> Result<()> {
        self.send(Action::DeleteTunnel { id: id.to_string() })
            .await
            .map(|_| ())
    }

    /// List every tunnel
    pub async fn list_tunnels(&mut self) -> Result<Vec<Tunnel>> {
        self.call(Action::ListTunnels).await
    }

    /// Fetch one tunnel
    pub async fn get_tunnel(&mut self, id: &str) -> Result<Tunnel> {
        self.call(Action::GetTunnel { id: id.to_string() }).await
    }

    /// Add a peer to a tunnel
    pub async fn new_peer(&mut self, req: NewPeer) -> Result<NewPeerResult> {
        self.call(Action::NewPeer(req)).await
    }

    /// Remove a peer from a tunnel
    pub async fn delete_peer(&mut self, tunnel_id: &str, peer_id: &str) -> Result<Tunnel> {
        self.call(Action::DeletePeer {
            tunnel_id: tunnel_id.to_string(),
            peer_id: peer_id.to_string(),
        })
        .await
    }

    async fn call<T: DeserializeOwned>(&mut self, action: Action) -> Result<T> {
        let data = self.send(action).await?.ok_or_else(|| {
            GuardError::Serialization("Response carried no data".to_string())
        })?;
        Ok(serde_json::from_value(data)?)
    }

    async fn send(&mut self, action: Action) -> Result<Option<serde_json::Value>> {
        let request = ApiRequest::new(format!("cli-{}", self.next_id), action);
        self.next_id += 1;

        let mut line = request.to_json()?;
        debug!("Sending request: {}", line);
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        let reply = self.lines.next_line().await?.ok_or_else(|| {
            GuardError::Infrastructure("Server closed the connection".to_string())
        })?;
        let response = ApiResponse::from_json(&reply)?;

        if response.id != request.id {
            return Err(GuardError::Serialization(format!(
                "Response {} does not match request {}",
                response.id, request.id
            )));
        }
        match (response.success, response.error) {
            (true, _) => Ok(response.data),
            (false, Some(e)) => Err(e.into()),
            (false, None) => Err(GuardError::Infrastructure(
                "Request failed without an error".to_string(),
            )),
        }
    }
}
