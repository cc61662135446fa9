use anyhow::Context;
use foldershopd::daemon::{DaemonConfig, DaemonRuntime, render_log_entry};
use foldershopd::storage::CredentialStorage;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "foldershopd=info,foldershop_core=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Scan,
    ResetRegistry,
    ClearLock,
    ShowLog,
    ClearLog,
    Status,
    StorePassword,
    ForgetPassword,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        mode = match arg.as_str() {
            "--scan" => CliMode::Scan,
            "--reset-registry" => CliMode::ResetRegistry,
            "--clear-lock" => CliMode::ClearLock,
            "--show-log" => CliMode::ShowLog,
            "--clear-log" => CliMode::ClearLog,
            "--status" => CliMode::Status,
            "--store-password" => CliMode::StorePassword,
            "--forget-password" => CliMode::ForgetPassword,
            "--help" | "-h" => CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        };
    }
    Ok(mode)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_help() {
    println!("Usage: foldershopd [OPTION]");
    println!("  (none)             Run the scheduler (and the webhook when configured)");
    println!("  --scan             Run one scan now and exit");
    println!("  --status           Show last scan time, registry size and lock holder");
    println!("  --reset-registry   Forget every processed file");
    println!("  --clear-lock       Release the scan lock whoever holds it");
    println!("  --show-log         Print the activity log");
    println!("  --clear-log        Empty the activity log");
    println!("  --store-password   Read the transport password from stdin into the keyring");
    println!("  --forget-password  Remove the stored transport password from the keyring");
}

fn keyring_account(config: &DaemonConfig) -> anyhow::Result<String> {
    config
        .credential_account()
        .context("a password is only stored for ftp or sftp sources")
}

async fn store_password(config: &DaemonConfig) -> anyhow::Result<()> {
    let account = keyring_account(config)?;
    let mut line = String::new();
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
    tokio::io::AsyncBufReadExt::read_line(&mut stdin, &mut line)
        .await
        .context("failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        anyhow::bail!("empty password");
    }
    CredentialStorage::new(&account)
        .and_then(|storage| storage.save_password(password))
        .context("failed to save password")?;
    tracing::info!("password stored for {account}");
    Ok(())
}

fn forget_password(config: &DaemonConfig) -> anyhow::Result<()> {
    let account = keyring_account(config)?;
    CredentialStorage::new(&account)
        .and_then(|storage| storage.delete_password())
        .context("failed to remove password")?;
    tracing::info!("password removed for {account}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_help();
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    match mode {
        CliMode::StorePassword => return store_password(&config).await,
        CliMode::ForgetPassword => return forget_password(&config),
        _ => {}
    }

    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Run => daemon.run().await,
        CliMode::Scan => {
            let outcome = daemon.scan_once().await?;
            println!("{}", outcome.describe());
            Ok(())
        }
        CliMode::ResetRegistry => {
            let removed = daemon.reset_registry().await?;
            println!("registry reset, {removed} entries removed");
            Ok(())
        }
        CliMode::ClearLock => {
            if daemon.clear_scan_lock().await? {
                println!("scan lock cleared");
            } else {
                println!("scan lock was not held");
            }
            Ok(())
        }
        CliMode::ShowLog => {
            let entries = daemon.activity_log().await?;
            if entries.is_empty() {
                println!("activity log is empty");
            }
            for entry in &entries {
                println!("{}", render_log_entry(entry));
            }
            Ok(())
        }
        CliMode::ClearLog => {
            let removed = daemon.clear_activity_log().await?;
            println!("activity log cleared, {removed} entries removed");
            Ok(())
        }
        CliMode::Status => {
            let status = daemon.status().await?;
            println!("{}", daemon.render_status(&status));
            Ok(())
        }
        CliMode::StorePassword | CliMode::ForgetPassword | CliMode::Help => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(rest: &[&str]) -> Vec<String> {
        std::iter::once("foldershopd")
            .chain(rest.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_admin_operations() {
        assert_eq!(parse_cli_mode(args(&["--scan"])).unwrap(), CliMode::Scan);
        assert_eq!(
            parse_cli_mode(args(&["--reset-registry"])).unwrap(),
            CliMode::ResetRegistry
        );
        assert_eq!(parse_cli_mode(args(&["--clear-lock"])).unwrap(), CliMode::ClearLock);
        assert_eq!(parse_cli_mode(args(&["--show-log"])).unwrap(), CliMode::ShowLog);
        assert_eq!(parse_cli_mode(args(&["--clear-log"])).unwrap(), CliMode::ClearLog);
        assert_eq!(parse_cli_mode(args(&["--status"])).unwrap(), CliMode::Status);
        assert_eq!(
            parse_cli_mode(args(&["--store-password"])).unwrap(),
            CliMode::StorePassword
        );
        assert_eq!(
            parse_cli_mode(args(&["--forget-password"])).unwrap(),
            CliMode::ForgetPassword
        );
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        assert_eq!(parse_cli_mode(args(&["-h"])).unwrap(), CliMode::Help);
        assert_eq!(parse_cli_mode(args(&["--help"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(args(&["--frobnicate"])).is_err());
    }
}
