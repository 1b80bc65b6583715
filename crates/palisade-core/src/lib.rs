//! Palisade, a locally-run agent gateway.
//!
//! Palisade mediates every interaction between untrusted LLM-driven agents
//! and the host environment: schema validation, capability checks,
//! risk-tiered human approval, dual rate limiting, content-policy
//! filtering, an emergency kill switch, provider failover, and a
//! tamper-evident audit log.
//!
//! The crate is a library; the `palisade-daemon` binary builds an
//! [`gateway::AppState`] composition root and serves the HTTP surface.

pub mod agent;
pub mod audit;
pub mod auth;
pub mod capability;
pub mod config;
pub mod consent;
pub mod filter;
pub mod memory;
pub mod monitor;
pub mod plugins;
pub mod providers;
pub mod ratelimit;
pub mod scheduler;
pub mod sessions;
pub mod supervisor;
pub mod telemetry;
pub mod tools;
pub mod webhooks;

#[cfg(feature = "gateway")]
pub mod gateway;
