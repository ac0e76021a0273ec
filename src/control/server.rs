//! Control server over TCP
//!
//! Clients send one JSON request per line and receive one JSON response per
//! line. A client whose connection fails while its request is in flight
//! cancels the request; once the request has reached the device it still runs
//! to completion so the store and the device stay in step. A client that only
//! closes its sending side still receives its response.

use crate::control::{ApiError, ApiRequest, ApiResponse, CommandHandler};
use crate::error::{GuardError, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Control server bound to a TCP address
pub struct ControlServer {
    listener: TcpListener,
    handler: Arc<CommandHandler>,
}

impl ControlServer {
    /// Bind the control listener
    pub async fn bind(addr: SocketAddr, handler: Arc<CommandHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            GuardError::Infrastructure(format!("Failed to bind control address {}: {}", addr, e))
        })?;
        Ok(Self { listener, handler })
    }

    /// Address actually bound, useful when binding port 0
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` completes
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Control server listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down control server");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = self.handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, handler).await {
                                error!("Connection handler error for {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    handler: Arc<CommandHandler>,
) -> std::result::Result<(), ApiError> {
    debug!("New client connection");

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Client disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to read from socket: {}", e);
                break;
            }
        }

        let request_str = line.trim();
        if request_str.is_empty() {
            continue;
        }
        debug!("Received request: {}", request_str);

        let response = match ApiRequest::from_json(request_str) {
            Ok(request) => {
                let ctx = handler.context();
                let work = handler.handle_request(&ctx, request);
                tokio::pin!(work);

                // Peeking leaves any pipelined request in the buffer; end of
                // stream is a half-close and the response is still owed
                let mut lost = false;
                let response = tokio::select! {
                    response = &mut work => response,
                    peeked = reader.fill_buf() => {
                        if let Err(e) = peeked {
                            warn!("Client connection lost ({}), cancelling request", e);
                            ctx.cancel();
                            lost = true;
                        }
                        work.await
                    }
                };

                if lost {
                    break;
                }
                response
            }
            Err(e) => {
                error!("Failed to parse request: {}", e);
                ApiResponse::error("unknown".to_string(), e)
            }
        };

        let mut response_str = response.to_json()?;
        response_str.push('\n');

        writer
            .write_all(response_str.as_bytes())
            .await
            .map_err(|e| ApiError::Infrastructure {
                message: format!("Failed to write response: {}", e),
            })?;

        writer.flush().await.map_err(|e| ApiError::Infrastructure {
            message: format!("Failed to flush response: {}", e),
        })?;
    }

    Ok(())
}
