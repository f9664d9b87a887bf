// `main.rs` is intentionally tiny: it sets up logging, reads configuration
// and delegates execution to `server::run()`.
use clap::Parser;
use soil_recorder::{config::{Args, Config}, server};

/// Start the recorder on a single-threaded runtime; the ingest loop never
/// needs more than one thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::load(&args)?;

    server::run(config).await
}
