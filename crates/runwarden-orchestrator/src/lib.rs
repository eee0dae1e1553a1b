//! runwarden Orchestrator Library
//!
//! This crate drives tasks through agent runs: the versioned store, the task
//! service, the readiness scheduler, the runtime execution service, and the
//! stuck-run detector, plus the supervisor loops that tie them together.

pub mod clock;
pub mod config;
pub mod detector;
pub mod error;
pub mod events;
pub mod fault;
pub mod provider;
pub mod redact;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod seed;
pub mod store;
pub mod supervisor;
pub mod tasks;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, DetectorConfig, RetryConfig};
pub use detector::{StuckRunDetector, SweepReport};
pub use error::OrchestratorError;
pub use events::{EventBus, EventSink};
pub use fault::{FaultInjector, FaultPoint, InjectedFault, NoopFaultInjector, ScriptedFaultInjector};
pub use provider::{EchoProvider, Provider};
pub use retry::RetryPolicy;
pub use runtime::{ExecutionOutcome, RecoveryReport, RuntimeService};
pub use scheduler::ReadinessScheduler;
pub use seed::{SeedError, SeedPlan};
pub use store::{InMemoryStore, Store, StoreError};
pub use supervisor::Supervisor;
pub use tasks::TaskService;
