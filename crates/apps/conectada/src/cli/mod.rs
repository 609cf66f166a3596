pub mod app;
pub mod output;
pub mod watch;

pub use app::Cli;
