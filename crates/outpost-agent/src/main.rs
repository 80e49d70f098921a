mod cli;
mod config;
mod paths;

use std::{fs, path::Path};

use clap::Parser;
use color_eyre::Result;
use outpost_crypto::cipher::ServerKey;
use outpost_identity::{
    resolver::{Fingerprint, IdentityResolver},
    signals::HostSignals,
};
use outpost_store::settings_store::SettingsStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Command, ConfigCommand, SettingCommand};
use crate::config::ConfigManager;

/// Entry point wiring the CLI to the identity, crypto, and storage cores.
fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let data_dir = paths::resolve_data_dir(cli.data_dir.as_deref());

    match cli.command {
        Command::MachineId => {
            println!("{}", resolve_fingerprint(&data_dir)?);
        }
        Command::Keygen => {
            println!("{}", ServerKey::generate().to_base64());
        }
        Command::Health(key_args) => {
            let store = open_store(&data_dir, resolve_server_key(&key_args)?)?;
            run_store_health(&store)?;
            println!("Storage: ok");
        }
        Command::Config(command) => run_config(command, &data_dir)?,
        Command::Setting(args) => {
            let store = open_store(&data_dir, resolve_server_key(&args.key)?)?;
            run_setting(args.command, &store)?;
        }
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn resolve_fingerprint(data_dir: &Path) -> Result<Fingerprint> {
    let resolver = IdentityResolver::new(HostSignals, paths::fingerprint_path(data_dir));
    Ok(resolver.resolve()?)
}

/// External key intake: flag first, then environment. Malformed key material
/// aborts here; nothing downstream ever runs unencrypted.
fn resolve_server_key(args: &cli::KeyArgs) -> Result<ServerKey> {
    let encoded = args
        .server_key
        .clone()
        .or_else(|| std::env::var("OUTPOST_SERVER_KEY").ok())
        .ok_or_else(|| {
            color_eyre::eyre::eyre!("no server key: pass --server-key or set OUTPOST_SERVER_KEY")
        })?;
    Ok(ServerKey::from_base64(&encoded)?)
}

fn open_store(data_dir: &Path, key: ServerKey) -> Result<SettingsStore> {
    fs::create_dir_all(data_dir)?;
    Ok(SettingsStore::open(paths::database_path(data_dir), key)?)
}

/// Write/read/delete probe against the encrypted store.
fn run_store_health(store: &SettingsStore) -> Result<()> {
    let probe_key = "health/probe";
    let payload = "ok";

    store.set(probe_key, payload)?;
    let round_trip = store.get(probe_key)?;
    store.delete(probe_key)?;

    if round_trip != payload {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}

fn run_config(command: ConfigCommand, data_dir: &Path) -> Result<()> {
    let fingerprint = resolve_fingerprint(data_dir)?;
    let manager = ConfigManager::new(paths::config_path(data_dir), fingerprint.as_str())?;

    match command {
        ConfigCommand::Show => {
            let config = manager.load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommand::Init => {
            let path = manager.write_default_if_missing()?;
            println!("Config initialized at {}", path.display());
        }
    }
    Ok(())
}

fn run_setting(command: SettingCommand, store: &SettingsStore) -> Result<()> {
    match command {
        SettingCommand::Get { key } => {
            println!("{}", store.get(&key)?);
        }
        SettingCommand::Set { key, value } => {
            store.set(&key, &value)?;
            println!("Updated {key}");
        }
        SettingCommand::Delete { key } => {
            store.delete(&key)?;
            println!("Deleted {key}");
        }
        SettingCommand::List => {
            let settings = store.list_all()?;
            for (key, value) in &settings.values {
                println!("{key}={value}");
            }
            if !settings.skipped.is_empty() {
                eprintln!(
                    "warning: {} setting(s) could not be decrypted: {}",
                    settings.skipped.len(),
                    settings.skipped.join(", ")
                );
            }
        }
        SettingCommand::Exists { key } => {
            println!("{}", store.exists(&key)?);
        }
    }
    Ok(())
}
