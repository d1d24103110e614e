pub mod controller;
pub mod route;
pub mod shadow;

pub use controller::{Controller, ControllerSettings};
pub use route::{ExecutionRoute, LiveRoute};
pub use shadow::ShadowRoute;
