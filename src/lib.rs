pub mod bus;
pub mod config;
pub mod controller;
pub mod errors;
pub mod gate;
pub mod logging;
pub mod plan;
pub mod registry;
pub mod server;
pub mod stages;
pub mod ui;
pub mod workflow;

pub use bus::{EventBus, Subscription};
pub use controller::{RunControl, RunController, RunTiming};
pub use plan::{Plan, PlanSource, Planner, StageDescriptor};
pub use registry::{ControlSignal, RunRegistry, RunRequest, RuntimeSettings};
