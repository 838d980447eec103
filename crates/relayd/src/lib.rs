pub mod config;
pub mod forwarder;
pub mod http_server;
pub mod metrics;
pub mod smtp_server;
