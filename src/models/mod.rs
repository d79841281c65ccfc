//! Domain models for Storyline.
//!
//! # Core Concepts
//!
//! - [`Project`]: Owner of a file set ([`ProjectFile`]) and of stories.
//! - [`Story`]: A user-authored unit of requested work. Its `status` is the
//!   pipeline state machine driven by the orchestrator.
//! - [`Task`]: Atomic implementation unit produced by dividing a story. Tasks
//!   depend on each other by durable id and move through their own
//!   sub-machine ([`TaskStatus`]).
//! - [`FileSnapshot`]: Pre-phase copy of a project file, used for rollback.
//! - [`AgentEvent`]: Immutable record published on the event bus; every
//!   published event is also appended to the audit log as an [`AgentLog`].

mod event;
mod project;
mod snapshot;
mod story;
mod task;

pub use event::*;
pub use project::*;
pub use snapshot::*;
pub use story::*;
pub use task::*;
