use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use iam_authz::server::{self, config::Config};
use iam_authz::store::bus::RedisBus;
use iam_authz::store::notification::{ChangeNotification, NotificationCommand, Notifier};
use iam_authz::utils;

#[derive(Parser)]
#[command(name = "iam-authz", version, about = "IAM authorization decision server")]
struct AppCli {
    /// Config file path
    #[arg(short, long, default_value = "config.json", global = true)]
    config: String,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ChangeKind {
    PolicyChanged,
    SecretChanged,
}

impl From<ChangeKind> for NotificationCommand {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::PolicyChanged => NotificationCommand::PolicyChanged,
            ChangeKind::SecretChanged => NotificationCommand::SecretChanged,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the authorization server (default)
    Serve,
    /// Publish a signed change notification to every instance
    Notify {
        #[arg(long, value_enum)]
        command: ChangeKind,
        #[arg(long, default_value = "")]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let args = AppCli::parse();
    let config = Config::from_file(&args.config)?;

    match args.command {
        Some(Commands::Notify { command, payload }) => {
            let bus = RedisBus::new(&config.redis.url)?;
            let notifier = Notifier::new(Arc::new(bus));
            let notification = ChangeNotification::new(command.into(), payload);
            if !notifier.notify(notification).await {
                bail!("change notification was not delivered");
            }
            info!("change notification published");
        }
        Some(Commands::Serve) | None => server::run(config).await?,
    }

    Ok(())
}
