use tracing_subscriber::EnvFilter;

use super::args::{Args, LogFormat};

pub fn init_logging(args: &Args) {
    let filter = EnvFilter::from_default_env().add_directive(args.log_level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!args.no_color);

    match args.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.pretty().init(),
        LogFormat::Text => subscriber.init(),
    };

    log::info!("pg_relay starting up (version {})", env!("CARGO_PKG_VERSION"));
}
