use clap::{Parser, Subcommand};

/// hostgate: local filesystem and command gateway for bearer-token clients
#[derive(Parser)]
#[command(name = "hostgate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to bind (overrides HOSTGATE_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage bearer tokens in the local store
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Write an example token file with the default global rules
    Init,

    /// Import legacy bearer secrets as admin tokens
    Migrate {
        /// Comma-separated secrets
        #[arg(long, env = "HOSTGATE_LEGACY_TOKENS")]
        tokens: Option<String>,
        /// File with one secret per line
        #[arg(long, env = "HOSTGATE_LEGACY_TOKEN_FILE")]
        token_file: Option<std::path::PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Create a new token and print its secret once
    Create {
        #[arg(long)]
        label: String,
        /// e.g. fs:read,exec
        #[arg(long, value_delimiter = ',', required = true)]
        scopes: Vec<String>,
        #[arg(long)]
        expires_in_days: Option<u32>,
        /// Repeatable, e.g. --rate-limit 10/1m --rate-limit 100/1h
        #[arg(long = "rate-limit")]
        rate_limits: Vec<String>,
    },
    /// List tokens (secrets are never shown)
    List,
    /// Issue a new secret for a token, invalidating the old one
    Rotate {
        #[arg(long)]
        token_id: String,
    },
    /// Disable a token
    Disable {
        #[arg(long)]
        token_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_token_create_args() {
        let cli = Cli::try_parse_from([
            "hostgate",
            "token",
            "create",
            "--label",
            "ci",
            "--scopes",
            "fs:read,exec",
            "--rate-limit",
            "10/1m",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Token {
                command:
                    TokenCommands::Create {
                        label,
                        scopes,
                        rate_limits,
                        ..
                    },
            }) => {
                assert_eq!(label, "ci");
                assert_eq!(scopes, vec!["fs:read", "exec"]);
                assert_eq!(rate_limits, vec!["10/1m"]);
            }
            _ => panic!("expected token create"),
        }
    }

    #[test]
    fn test_no_subcommand_serves() {
        let cli = Cli::try_parse_from(["hostgate"]).unwrap();
        assert!(cli.command.is_none());
    }
}
