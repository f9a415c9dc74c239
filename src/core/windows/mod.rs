//! Windows session layer: the pty agent and its deferred-call terminal.

pub mod agent;
pub mod terminal;

pub use terminal::WindowsTerminal;
