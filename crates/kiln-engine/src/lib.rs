pub mod adapters;
pub mod assets;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod fallback;
pub mod poller;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use engine::{GenerationEngine, Submission};
pub use fallback::{FallbackChain, FallbackExhausted, FallbackOutcome, FallbackReport, FallbackStep};
pub use poller::{PollOutcome, PollPolicy, StatusProbe, TaskPoller};
pub use transport::{InboundReply, OutboundRequest, ReqwestTransport, Transport, TransportError};
