mod app;
pub mod components;

pub use app::{TerminalApp, render_screen};
