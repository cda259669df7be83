use clap::Parser;
use kidecar::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    cli.init_tracing();

    if let Err(e) = cli.execute().await {
        eprintln!("✗ Error: {:#}", e);
        std::process::exit(1);
    }
}
