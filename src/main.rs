//! laneforge entry point: parses CLI arguments and starts the server or
//! validates a configuration file.

use laneforge::{cli, config::Config, server, telemetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = cli::parse_args();
    telemetry::init();

    match cli.command {
        Some(cli::Commands::Start { port, host }) => {
            if !cli.quiet && cli.verbose {
                tracing::info!(version = env!("CARGO_PKG_VERSION"), %host, port, "starting laneforge");
            }
            server::start_server(cli.verbose, cli.quiet, host, port).await?;
        }
        Some(cli::Commands::Config { validate }) => {
            if validate {
                match Config::load() {
                    Ok(config) => {
                        println!("configuration valid");
                        if cli.verbose {
                            println!("server: {}:{}", config.server.host, config.server.port);
                            println!("data dir: {}", config.storage.data_dir);
                        }
                    }
                    Err(e) => {
                        eprintln!("configuration error: {e}");
                        std::process::exit(1);
                    }
                }
            }
        }
        None => {
            server::start_server(cli.verbose, cli.quiet, "0.0.0.0".to_string(), 8080).await?;
        }
    }

    Ok(())
}
