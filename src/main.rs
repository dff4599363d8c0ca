use pg_relay::{app, config};

fn main() {
    let args = app::parse();
    app::init_logging(&args);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build bootstrap runtime");

    let loaded = runtime.block_on(config::load(&args.config_file));
    let config = match loaded {
        Ok(config) => config,
        Err(err) => {
            log::error!("failed to load config {}: {err}", args.config_file);
            std::process::exit(exitcode::CONFIG);
        }
    };
    drop(runtime);

    if args.test_config {
        log::info!("configuration file {} is valid", args.config_file);
        std::process::exit(exitcode::OK);
    }

    if let Err(err) = app::run_server(args, config) {
        log::error!("server exited with error: {err}");
        std::process::exit(exitcode::SOFTWARE);
    }
}
