//! Algorithms - Pluggable state machines and the runtime that drives them

pub mod bandwagon;
pub mod registry;
pub mod runtime;
pub mod state;

pub use runtime::{AlgorithmRuntime, RuntimeServices, RuntimeStatus, StateMachine, StateSwitch};
pub use state::{RuntimeEvent, State, StateContext, Transition};
