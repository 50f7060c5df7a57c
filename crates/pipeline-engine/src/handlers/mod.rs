// Step handlers: one per step kind.

pub mod gate_handler;
pub mod handler;
pub mod script_handler;

pub use handler::{Handler, HandlerData, HandlerFactory};
