mod commands;

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use borgboi_core::config::{self, Config};
use borgboi_storage::{open_storage, BackendKind};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::commands::Command;

const USAGE: &str = "usage: borgboi-admin [--config PATH] [--offline | --backend offline|sqlite|dynamodb] <command>

commands:
  list                      list every stored repository
  show <name>               print one repository as JSON
  show-path <path> [host]   look a repository up by path
  remove <name>             delete a repository's metadata
  migrate-passphrases       move inline passphrases into passphrase files
  migrate-legacy            replay leftover legacy data into the local database
  export-offline <dir>      copy every repository into a JSON store at <dir>";

struct Args {
    config_path: Option<PathBuf>,
    offline: bool,
    backend: Option<BackendKind>,
    command: Command,
}

fn main() -> Result<()> {
    let args = parse_args(env::args().skip(1))?;

    let mut cfg = match &args.config_path {
        Some(path) => config::load_config(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => config::load_default().context("loading default config")?,
    };
    if args.offline {
        cfg.offline = true;
    }

    let default_level = if cfg.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Some(path) = &args.config_path {
        info!(?path, "loaded config file");
    }
    for warning in cfg.validate() {
        tracing::warn!(%warning, "config");
    }

    if args.command == Command::MigrateLegacy {
        return commands::migrate_legacy(&cfg);
    }

    let kind = args.backend.unwrap_or_else(|| BackendKind::from_config(&cfg));
    debug!(backend = %kind, home = %cfg.home_dir().display(), "resolved backend");
    let storage = open_storage(&cfg, kind).with_context(|| format!("opening {kind} storage"))?;

    commands::run(&cfg, storage.as_ref(), args.command)
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let args: Vec<String> = args.into_iter().collect();
    let mut config_path = None;
    let mut offline = false;
    let mut backend = None;
    let mut positional = Vec::new();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let Some(path) = args.get(i) else {
                    bail!("--config requires a path argument");
                };
                config_path = Some(PathBuf::from(path));
            }
            "--backend" => {
                i += 1;
                let Some(name) = args.get(i) else {
                    bail!("--backend requires one of offline, sqlite, dynamodb");
                };
                backend = Some(name.parse::<BackendKind>()?);
            }
            "--offline" => offline = true,
            "-h" | "--help" => bail!("{USAGE}"),
            flag if flag.starts_with("--") => bail!("unknown flag {flag}\n\n{USAGE}"),
            other => positional.push(other.to_owned()),
        }
        i += 1;
    }

    if offline && backend == Some(BackendKind::DynamoDb) {
        bail!("--offline conflicts with --backend dynamodb");
    }

    let command = Command::parse(&positional).with_context(|| USAGE.to_owned())?;
    Ok(Args {
        config_path,
        offline,
        backend,
        command,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        parse_args(args.iter().map(|s| (*s).to_owned()))
    }

    #[test]
    fn flags_and_command_in_any_order() {
        let args = parse(&["show", "--backend", "sqlite", "docs", "--config", "/etc/bb.toml"]).unwrap();
        assert_eq!(args.backend, Some(BackendKind::Sqlite));
        assert_eq!(args.config_path, Some(PathBuf::from("/etc/bb.toml")));
        assert_eq!(args.command, Command::Show("docs".into()));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["list", "--config"]).is_err());
        assert!(parse(&["list", "--backend", "postgres"]).is_err());
        assert!(parse(&["--offline", "--backend", "dynamodb", "list"]).is_err());
        assert!(parse(&["list", "--verbose"]).is_err());
    }
}
