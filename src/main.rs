use clap::Parser;
use gog_cli::accounts::ACCOUNT_ENV;
use gog_cli::api::{Authorizer, ClientCredentials, GoogleIdentityVerifier, GoogleOAuthClient};
use gog_cli::args::{AliasCommand, Args, AuthCommand, Command, ServiceAccountCommand, TokensCommand};
use gog_cli::commands::{self, Flags};
use gog_cli::secrets::{KeyringBackendInfo, SecretStore};
use gog_cli::service_account::ServiceAccountRegistry;
use gog_cli::{Config, Result};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let log_level = args.common().log_level();
    init_logger(log_level);
    debug!("Log level set to {}", log_level.to_string().to_lowercase());

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Unable to listen for Ctrl-C: {e}");
            return;
        }
        debug!("Ctrl-C received");
        on_ctrl_c.cancel();
    });

    match main_inner(args, cancel).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Exiting with error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

pub async fn main_inner(args: Args, cancel: CancellationToken) -> Result<()> {
    trace!("{args:?}");
    let common = args.common();
    let json = common.json();
    let mut config = Config::load(common.config_dir().path()).await?;
    let flags = Flags::new(common.account(), common.force(), common.no_input())
        .with_account_env(std::env::var(ACCOUNT_ENV).ok());
    let registry = ServiceAccountRegistry::new(config.root());

    let Command::Auth(auth) = args.command();
    let _: () = match auth {
        AuthCommand::Credentials(a) => commands::credentials(&config, a.path()).await?.print(json),

        AuthCommand::Add(a) => {
            let authorizer = authorizer(&config, open_store(&config)?).await?;
            let input = BufReader::new(tokio::io::stdin());
            commands::add(&authorizer, a, &cancel, input)
                .await?
                .print(json)
        }

        AuthCommand::Services => commands::services().print(json),

        AuthCommand::List(a) => {
            let store = open_store(&config)?;
            if a.check() {
                let authorizer = authorizer(&config, store.clone()).await?;
                commands::list(&store, &registry, Some((&authorizer, a.timeout())))
                    .await?
                    .print(json)
            } else {
                commands::list(&store, &registry, None).await?.print(json)
            }
        }

        AuthCommand::Alias(alias) => match alias {
            AliasCommand::Set(a) => commands::alias_set(&mut config, a.alias(), a.email())
                .await?
                .print(json),
            AliasCommand::Unset(a) => commands::alias_unset(&mut config, a.alias())
                .await?
                .print(json),
            AliasCommand::List => commands::alias_list(&config).print(json),
        },

        AuthCommand::Status => {
            let keyring = KeyringBackendInfo::resolve(&config)?;
            let store = SecretStore::open(&keyring, &config)
                .map_err(|e| warn!("Unable to open the secret store: {e:#}"))
                .ok();
            commands::status(&config, keyring, store.as_ref(), &flags)
                .await?
                .print(json)
        }

        AuthCommand::Keyring(a) => commands::keyring(&mut config, a.backend())
            .await?
            .print(json),

        AuthCommand::Default(a) => {
            commands::set_default(&open_store(&config)?, a.email())?.print(json)
        }

        AuthCommand::Remove(a) => {
            commands::remove(&open_store(&config)?, a.email(), &flags)?.print(json)
        }

        AuthCommand::Tokens(tokens) => {
            let store = open_store(&config)?;
            match tokens {
                TokensCommand::List => commands::tokens_list(&store)?.print(json),
                TokensCommand::Delete(a) => {
                    commands::tokens_delete(&store, a.email(), &flags)?.print(json)
                }
                TokensCommand::Export(a) => {
                    commands::tokens_export(&store, a.email(), a.out(), a.overwrite())
                        .await?
                        .print(json)
                }
                TokensCommand::Import(a) => commands::tokens_import(&store, a.path())
                    .await?
                    .print(json),
            }
        }

        AuthCommand::Manage(a) => {
            let authorizer = authorizer(&config, open_store(&config)?).await?;
            commands::manage(&authorizer, a, &cancel).await?.print(json)
        }

        AuthCommand::ServiceAccount(sa) => match sa {
            ServiceAccountCommand::Set(a) => {
                commands::service_account_set(&registry, a.email(), a.key())
                    .await?
                    .print(json)
            }
            ServiceAccountCommand::Unset(a) => {
                commands::service_account_unset(&registry, a.email(), &flags)
                    .await?
                    .print(json)
            }
            ServiceAccountCommand::Status(a) => {
                commands::service_account_status(&registry, a.email())
                    .await?
                    .print(json)
            }
        },

        AuthCommand::Keep(a) => commands::keep(&registry, a.email(), a.key())
            .await?
            .print(json),

        AuthCommand::Whoami => {
            let store = open_store(&config)
                .map_err(|e| debug!("Unable to open the secret store: {e:#}"))
                .ok();
            commands::whoami(&config, store.as_ref(), &registry, &flags)
                .await?
                .print(json)
        }
    };
    Ok(())
}

/// Opens the secret store selected by `GOG_KEYRING_BACKEND` or the config file.
fn open_store(config: &Config) -> Result<SecretStore> {
    let info = KeyringBackendInfo::resolve(config)?;
    debug!(
        "Keyring backend {} (from {})",
        info.value(),
        info.source()
    );
    SecretStore::open(&info, config)
}

/// Builds an authorizer that talks to Google with the saved OAuth client.
async fn authorizer(config: &Config, store: SecretStore) -> Result<Authorizer> {
    let credentials = ClientCredentials::load(&config.client_credentials_path()).await?;
    Ok(Authorizer::new(
        Arc::new(GoogleOAuthClient::new(credentials)?),
        Arc::new(GoogleIdentityVerifier::new()?),
        store,
    ))
}

/// Initializes the tracing subscriber.
pub fn init_logger(level: LevelFilter) {
    let filter = match std::env::var("RUST_LOG").ok() {
        Some(_) => {
            // RUST_LOG exists; use it.
            EnvFilter::from_default_env()
        }
        None => {
            // RUST_LOG does not exist; use default log level for this package only.
            EnvFilter::new(format!(
                "{}={},{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                level,
                env!("CARGO_BIN_NAME"),
                level
            ))
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
