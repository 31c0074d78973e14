//! Execution layer used by task steps to perform delegated work

pub mod layer;
pub mod retry;
pub mod router;
pub mod work;

pub use layer::{ExecutionLayer, AGENT_TARGET_PREFIX};
pub use retry::{is_retryable, retry_with_delay, RetryPolicy};
pub use router::{Router, RoutingStrategy, TargetProfile};
pub use work::{EchoWorker, WorkOutcome, WorkStatus, WorkUnit, Worker, WorkerFactory};
