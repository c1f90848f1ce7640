//! Command-line interface for kubeplan.
//!
//! The binary is a thin wrapper: every command maps onto one
//! [`Reconciler`](crate::reconciler::Reconciler) or state store call.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
