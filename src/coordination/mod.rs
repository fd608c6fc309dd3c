//! Swap coordination
//!
//! The pieces that move an order through its life:
//! 1. The engine runs one driver task per order and consumes the event bus
//! 2. The secret coordinator propagates a revealed preimage across legs
//! 3. The timeout monitor refunds escrows nothing else will touch

pub mod engine;
pub mod secret;
pub mod timeout;

pub use engine::{OrderCommand, SwapEngine};
pub use secret::{PropagationOutcome, SecretCoordinator};
pub use timeout::TimeoutMonitor;
