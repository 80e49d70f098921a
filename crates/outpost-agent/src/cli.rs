use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// CLI surface of the endpoint agent. The HTTP and service-lifecycle layers
/// sit above this binary; everything here talks to the core directly.
#[derive(Parser, Debug)]
#[command(
    name = "outpost",
    about = "Offline-capable endpoint agent with machine-bound encrypted storage",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Override the data directory (database, config, fingerprint cache).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Resolve and print the machine fingerprint.
    MachineId,
    /// Generate a new 32-byte server key and print it as base64.
    Keygen,
    /// Run a round-trip health check against the encrypted settings store.
    Health(KeyArgs),
    /// Inspect or initialize the encrypted agent configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Operate on encrypted settings.
    Setting(SettingArgs),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Print the current configuration as JSON.
    Show,
    /// Create an encrypted default config file if one does not exist.
    Init,
}

/// Server-key intake shared by every command that opens the database domain.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct KeyArgs {
    /// Base64-encoded 32-byte server key; falls back to OUTPOST_SERVER_KEY.
    #[arg(long)]
    pub server_key: Option<String>,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct SettingArgs {
    #[command(flatten)]
    pub key: KeyArgs,

    #[command(subcommand)]
    pub command: SettingCommand,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum SettingCommand {
    /// Print the decrypted value of one setting.
    Get { key: String },
    /// Insert or replace a setting.
    Set { key: String, value: String },
    /// Remove a setting.
    Delete { key: String },
    /// Print every decryptable setting.
    List,
    /// Check whether a setting exists.
    Exists { key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_machine_id_subcommand() {
        let cli = Cli::try_parse_from(["outpost", "machine-id"]).expect("parse should succeed");
        assert_eq!(cli.command, Command::MachineId);
    }

    #[test]
    fn parses_setting_set_with_server_key() {
        let cli = Cli::try_parse_from([
            "outpost",
            "setting",
            "--server-key",
            "abc=",
            "set",
            "store_id",
            "42",
        ])
        .expect("parse should succeed");

        match cli.command {
            Command::Setting(args) => {
                assert_eq!(args.key.server_key.as_deref(), Some("abc="));
                assert_eq!(
                    args.command,
                    SettingCommand::Set {
                        key: "store_id".into(),
                        value: "42".into(),
                    }
                );
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_global_data_dir_override() {
        let cli = Cli::try_parse_from(["outpost", "--data-dir", "/tmp/outpost", "keygen"])
            .expect("parse should succeed");
        assert_eq!(cli.data_dir.as_deref(), Some(std::path::Path::new("/tmp/outpost")));
        assert_eq!(cli.command, Command::Keygen);
    }

    #[test]
    fn parses_config_init_subcommand() {
        let cli = Cli::try_parse_from(["outpost", "config", "init"]).expect("parse should succeed");
        assert_eq!(cli.command, Command::Config(ConfigCommand::Init));
    }
}
