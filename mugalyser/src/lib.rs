pub mod cli;
pub mod load_config;
pub mod mugs;
pub mod output;

pub use cli::{run, Cli, Commands};
