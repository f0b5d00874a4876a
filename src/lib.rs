//! # socketry
//!
//! A from-scratch HTTP/1.1 and WebSocket server written in Rust: an async
//! accept loop, an HTTP codec, the WebSocket handshake and frame codec,
//! a route table with groups and fallbacks, and a middleware pipeline.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use socketry::app::App;
//! use socketry::config::ServerConfig;
//! use socketry::router::Router;
//! use socketry::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.get("/hello/:name", |_req, res, params| {
//!         res.text(format!("Hello, {}!", params.get("name").unwrap_or("world")));
//!     })?;
//!
//!     let config = ServerConfig {
//!         addr: "127.0.0.1:8080".into(),
//!         ..ServerConfig::default()
//!     };
//!     let server = Server::bind(config).await?;
//!     println!("Listening on http://{}", server.local_addr());
//!     server.run(App::new(router)).await?;
//!     Ok(())
//! }
//! ```
//!
//! WebSocket clients connect to any path with a valid upgrade request; the
//! default handler echoes each message back and broadcasts it to every
//! connected client.

pub mod app;
pub mod cache;
pub mod config;
pub mod http;
pub mod middleware;
pub mod realtime;
pub mod router;
pub mod server;
pub mod template;

pub use app::App;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};
