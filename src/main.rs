use clap::Parser;
use log::info;

use zamail::bootstrap::{bootstrap, bootstrap_config_from_env};
use zamail::cli::{connect, render_report, run_demo, Args, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = bootstrap_config_from_env()?;
    args.apply(&mut cfg);
    info!("Starting zamail on chain {}", cfg.chain_id);

    let app = bootstrap(cfg)?;
    let result = match args.command.clone().unwrap_or(Commands::Status) {
        Commands::Status => connect(&app).await.map(|_| ()),
        Commands::Demo { text } => run_demo(&app, &text).await.map(|clear| {
            info!("Recipient decrypted: {:?}", clear.clear);
        }),
    };
    println!("{}", render_report(&app.coordinator.snapshot()));
    app.shutdown().await;
    result
}
