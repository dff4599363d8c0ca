//! Process bootstrap: CLI parsing, logging setup, TLS acceptor
//! construction, and the tokio runtime/accept-loop lifecycle.

mod args;
mod logger;
mod server;
mod tls;

pub use args::{parse, Args};
pub use logger::init_logging;
pub use server::run_server;
