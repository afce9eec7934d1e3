//! Binary entrypoint for `sweb-server`.

use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = sweb_server::app::run() {
        eprintln!("failed to start sweb-server: {err}");
        std::process::exit(1);
    }
}
