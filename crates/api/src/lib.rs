//! HTTP surface and process wiring of the `agent-executor` service.

pub mod app;
