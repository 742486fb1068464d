//! GeoPresence Deterministic Simulation Harness
//!
//! Runs the real presence client (connection manager, merge store, bridge)
//! against an in-process scripted hub on a virtual clock.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: `SimContext` advances virtual time on every sleep
//! - **Network**: `SimHub` decides when connects succeed, sockets drop, and
//!   what arrives on the wire
//! - **Reconnection**: `ScriptedReconnectPolicy` replaces backoff with a
//!   fixed, recorded delay list
//! - **Randomness**: all generated traffic derives from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │               current-thread tokio runtime               │
//! │  ┌──────────────────┐   frames    ┌───────────────────┐  │
//! │  │  PresenceBridge  │◄───────────►│      SimHub       │  │
//! │  │  ConnectionMgr   │  SimSocket  │ (fault injection) │  │
//! │  │  MergeStore      │             └───────────────────┘  │
//! │  └────────┬─────────┘                                    │
//! │           │ sleep()                                      │
//! │  ┌────────▼─────────┐                                    │
//! │  │    SimContext    │  virtual clock                     │
//! │  └──────────────────┘                                    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use geopresence_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::StateFidelity);
//! assert!(result.passed);
//! ```

mod context;
mod harness;
mod hub;
mod policy;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use harness::{drain, settle, Drained, Harness, SimBridge, SimManager, SIM_ENDPOINT};
pub use hub::{SimHub, SimSocket};
pub use policy::ScriptedReconnectPolicy;
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
