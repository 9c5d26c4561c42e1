use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "tributary", version, about = "Data collection pipelines for engineering tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the HTTP server, the pipeline queue and the blueprint scheduler (default).
    Serve {
        #[arg(long, env = "TRIBUTARY_HOST", default_value = "0.0.0.0")]
        host: String,
        #[arg(long, env = "TRIBUTARY_PORT", default_value = "8080")]
        port: u16,

        /// Overrides `TRIBUTARY_DB_PATH`.
        #[arg(long)]
        db_path: Option<PathBuf>,
    },

    /// Print the effective engine configuration.
    Config,

    /// List compiled-in plugins and their subtasks.
    Plugins,
}

impl Commands {
    pub fn default_serve() -> Self {
        Commands::Serve {
            host: "0.0.0.0".to_string(),
            port: 8080,
            db_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_flags() {
        let cli = Cli::try_parse_from(["tributary", "serve", "--port", "9000", "--db-path", "/tmp/t.db"]).unwrap();
        match cli.command {
            Some(Commands::Serve { port, db_path, .. }) => {
                assert_eq!(port, 9000);
                assert_eq!(db_path, Some(PathBuf::from("/tmp/t.db")));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(Cli::try_parse_from(["tributary"]).unwrap().command.is_none());
    }
}
