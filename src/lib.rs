//! Trustgate: a trust-aware authorization engine for autonomous agents.
//!
//! Every agent action is scored for risk, weighed against the agent's
//! decaying trust, and then auto-approved, approved with logging, routed to
//! a human, or denied. Approved actions receive a short-lived signed
//! capability token and a node in the causal lineage graph. Completed
//! actions are sealed into a hash-chained, signed audit log.
//!
//! [`engine::Engine`] builds all components from an
//! [`config::EngineConfig`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod logging;
pub mod signing;
pub mod store;

pub mod risk;
pub mod trust;

pub mod lineage;
pub mod token;

pub mod audit;
pub mod budget;
pub mod hitl;

pub mod engine;
pub mod orchestrator;
