pub mod priority;
pub mod queue;
pub mod telemetry;

pub use priority::Priority;
pub use queue::{ComponentId, PendingUpdate, UpdateQueue};
pub use telemetry::DrainTelemetry;
