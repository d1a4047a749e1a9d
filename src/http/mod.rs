//! HTTP middleware and server for admission control.

mod middleware;
mod server;

pub use middleware::{AdmissionLayer, AdmissionService, RemoteAddr};
pub use server::{spawn_sweeper, HttpServer};
