//! gRPC transport for the admission API.

pub mod client;
pub mod codec;
mod server;
mod service;
pub mod wire;

pub use client::RemoteLimiter;
pub use server::GrpcServer;
pub use service::{call_context, AdmissionService};

// Generated by build.rs from a hand-built service description.
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/admission.v1.Admission.rs"));
}

pub use proto::admission_client::AdmissionClient;
pub use proto::admission_server::{Admission, AdmissionServer};
