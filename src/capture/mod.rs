//! C10 — capture: console/network event sinks, an error aggregator built on
//! top of them, a screenshot encoder, and the evaluate-result serializer.

pub mod console;
pub mod errors;
pub mod eval;
pub mod network;
pub mod screenshot;

pub use console::ConsoleCapture;
pub use errors::ErrorAggregator;
pub use network::NetworkCapture;
