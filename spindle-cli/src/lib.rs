//! Spindle command line: argument definitions and the built-in functions
//! shared by the controller and its worker processes.

pub mod cli;
pub mod functions;

pub use functions::builtin_registry;
