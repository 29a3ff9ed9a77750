//! Library side of the `skiff` binary: configuration, the HTTP block runner
//! and event output.

mod config;
mod output;
mod runner;

pub use config::{ConfigError, SkiffConfig};
pub use output::{event_line, JsonLinesSink};
pub use runner::HttpBlockRunner;
