//! The gateway server: accepts length-prefixed binary requests over TCP,
//! routes them to pooled per-model runners, and answers on a second port
//! with health and metrics over HTTP.

mod conn;
mod error;
mod gateway;
mod http;
mod manager;

pub use error::{ManagerError, ServerError};
pub use gateway::{BoundGateway, Gateway};
pub use http::{bind_http, serve_http};
pub use manager::ModelManager;
