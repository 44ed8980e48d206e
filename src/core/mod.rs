pub mod config;
pub mod error;
pub mod ingress;
pub mod job;
pub mod store;
