//! Operator console runtime.
//!
//! The console holds the persistent link to the coordinator, mirrors agent
//! state from the pushed event stream, derives the advisory round plan, and
//! drives the session lifecycle through request/response calls. All mutable
//! state lives on one event loop ([`console::Console::run`]).

pub mod console;
pub mod controller;
pub mod coordinator;
pub mod events;
pub mod link;
pub mod planner;
pub mod registry;
pub mod router;
pub mod state;

pub use console::{Command, CommandKind, Console, ConsoleHandle};
pub use controller::{SessionController, StartPlan, StartRequest};
pub use coordinator::{Coordinator, HttpCoordinator};
pub use events::ConsoleEvent;
pub use link::{Backoff, Link, LinkEvent, LinkHandle};
pub use planner::RoundPlan;
pub use registry::{AgentRegistry, FleetAggregates};
pub use state::ConsoleContext;
