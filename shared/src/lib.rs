pub mod admin_service;
pub mod event;
pub mod http;
pub mod metrics_defs;
