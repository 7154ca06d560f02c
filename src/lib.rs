//! Signal-driven trade lifecycle engine: validated alerts are routed to a
//! logic variant, sized by the risk gate and opened as two-leg groups whose
//! closes feed profit-booking chains, re-entries and the exit engine.

pub mod broker;
pub mod bybit_api;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod exit_strategy;
pub mod position_manager;
pub mod profit_chain;
pub mod reentry;
pub mod risk_manager;
pub mod router;
pub mod store;
pub mod telegram;
pub mod types;
pub mod validator;

pub use engine::{LifecycleEngine, SignalOutcome};
pub use error::EngineError;
