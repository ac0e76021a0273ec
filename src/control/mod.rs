//! Control API
//!
//! Line-delimited JSON over TCP. [`ControlServer`] accepts requests and hands
//! them to the [`CommandHandler`]; [`ControlClient`] is the matching client.

mod api;
mod client;
mod handler;
mod server;

pub use api::{Action, ApiError, ApiRequest, ApiResponse};
pub use client::ControlClient;
pub use handler::{CommandHandler, DEFAULT_REQUEST_TIMEOUT};
pub use server::ControlServer;
