//! Long-running tasks of the engine
//!
//! ## Architecture Overview
//!
//! ```text
//!        ┌──────────────┐   ┌──────────────┐
//!        │ fast cadence │   │ slow cadence │      ScheduleHandle
//!        └──────┬───────┘   └──────┬───────┘
//!               │ run_cycle        │
//!               └────────┬─────────┘
//!                ┌───────▼────────┐
//!                │  Orchestrator  │  bounded pool of device checks
//!                └───────┬────────┘
//!                        │ per-device outcome
//!                ┌───────▼────────┐
//!                │  AlertEngine   │
//!                └───────┬────────┘
//!                        │ broadcast AlertEvent
//!                ┌───────▼────────┐
//!                │ AlertNotifier  │  webhook
//!                └────────────────┘
//!
//!        RetentionActor: daily metric cleanup
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: actors take control messages over an mpsc channel
//! 2. **Events**: alert lifecycle changes fan out over a broadcast channel
//! 3. **Request/Response**: oneshot channels for synchronous queries

pub mod messages;
pub mod notifier;
pub mod orchestrator;
pub mod retention;
pub mod schedule;

pub use notifier::NotifierHandle;
pub use orchestrator::PollingOrchestrator;
pub use retention::RetentionHandle;
pub use schedule::ScheduleHandle;
