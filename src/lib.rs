pub mod daemon;

pub use daemon::Daemon;
pub use daemon::config::Config;
pub use daemon::types::{Connection, ParseError};
