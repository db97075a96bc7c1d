use log::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install tracing subscriber: {}", e);
    }
    // Route `log` records from the library into the tracing subscriber.
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to install log bridge: {}", e);
    }

    girouette::tls::install_crypto_provider();

    if let Err(e) = girouette::run().await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}
