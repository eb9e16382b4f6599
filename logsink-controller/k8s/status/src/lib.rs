#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
mod state;


pub use self::{
    controller::{Controller, ControllerMetrics},
    state::{Phase, ReconciliationState, SharedState, TargetState, Update},
};
