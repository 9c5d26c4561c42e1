use clap::Parser;
use std::net::SocketAddr;
use tributary_core::EngineConfig;
use tributary_core::o11y::{LogFormat, init_tracing};
use tributary_server::cli::{Cli, Commands};
use tributary_server::server::{AppState, serve};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(LogFormat::from_env())?;
    let cli = Cli::parse();
    let mut config = EngineConfig::from_env()?;
    let registry = tributary_integrations::default_registry()?;

    match cli.command.unwrap_or_else(Commands::default_serve) {
        Commands::Serve { host, port, db_path } => {
            if let Some(path) = db_path {
                config.db_path = path;
                config.validate()?;
            }
            let addr: SocketAddr = format!("{host}:{port}").parse()?;
            let state = AppState::open(config, registry).await?;
            serve(addr, state).await?;
        }
        Commands::Config => {
            println!("{config:#?}");
        }
        Commands::Plugins => {
            for info in registry.list() {
                println!("{}: {}", info.name, info.description);
                for st in info.subtask_metas {
                    let flag = if st.enabled_by_default { "" } else { " (off by default)" };
                    println!("  {}{flag}: {}", st.name, st.description);
                }
            }
        }
    }
    Ok(())
}
