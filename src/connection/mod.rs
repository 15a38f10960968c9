//! TCP transport.
//!
//! Each accepted socket gets its own task running a [`ConnectionHandler`].
//! The handler parses RESP requests, forwards them to the shared
//! [`Engine`](crate::engine::Engine) and writes replies back, while also
//! pushing watch notifications for the subscriptions that client holds.
//!
//! ```text
//!   TcpListener ──accept──> ConnectionHandler ──evaluate──> Engine
//!                                 ▲                           │
//!                                 └──── NotificationStream ◀──┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tidekv::config::EngineConfig;
//! use tidekv::connection::{handle_connection, ConnectionStats};
//! use tidekv::engine::Engine;
//! use tokio::net::TcpListener;
//!
//! # async fn serve() -> anyhow::Result<()> {
//! let engine = Arc::new(Engine::with_builtins(EngineConfig::default())?);
//! let stats = Arc::new(ConnectionStats::new());
//! let listener = TcpListener::bind("127.0.0.1:6380").await?;
//!
//! loop {
//!     let (stream, addr) = listener.accept().await?;
//!     tokio::spawn(handle_connection(stream, addr, Arc::clone(&engine), Arc::clone(&stats)));
//! }
//! # }
//! ```

pub mod handler;

pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
