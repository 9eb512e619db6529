//! These structs provide the CLI interface for the gog CLI.

use crate::api::{DriveScope, DEFAULT_AUTHORIZE_TIMEOUT, DEFAULT_MANAGE_TIMEOUT, IDENTITY_TIMEOUT};
use crate::secrets::KeyringBackend;
use clap::{Parser, Subcommand};
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;

/// gog: Google Workspace from the command line.
///
/// This is the account and credential half of gog. It stores OAuth refresh tokens for any number
/// of Google accounts in your OS keychain (or an encrypted file), keeps service account keys for
/// Workspace domain-wide delegation, and decides which account a command acts as.
///
/// Get started by downloading a "Desktop app" OAuth client from Google Cloud Console, then:
///
///   gog auth credentials ~/Downloads/client_secret.json
///
///   gog auth add you@example.com
#[derive(Debug, Parser, Clone)]
#[command(name = "gog", version)]
pub struct Args {
    #[clap(flatten)]
    common: Common,

    #[command(subcommand)]
    command: Command,
}

impl Args {
    pub fn common(&self) -> &Common {
        &self.common
    }

    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Manage Google accounts, OAuth tokens and service accounts.
    #[command(subcommand)]
    Auth(AuthCommand),
}

/// Arguments common to all subcommands.
#[derive(Debug, Parser, Clone)]
pub struct Common {
    /// The logging verbosity. One of, from least to most verbose:
    /// off, error, warn, info, debug, trace
    ///
    /// This can be overridden by RUST_LOG.
    #[arg(long, global = true, default_value_t = LevelFilter::INFO)]
    log_level: LevelFilter,

    /// The directory holding config.json, credentials.json and service account keys. Defaults to
    /// the gogcli directory in your OS config directory.
    #[arg(long, global = true, env = "GOG_CONFIG_DIR", default_value_t = default_config_dir())]
    config_dir: DisplayPath,

    /// The account (email or alias) to act as. Falls back to GOG_ACCOUNT, then the default
    /// account, then the only stored account. `auto` and `default` mean "pick for me".
    #[arg(short = 'a', long, global = true)]
    account: Option<String>,

    /// Print structured output as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    /// Do not ask for confirmation before destructive operations.
    #[arg(long, global = true)]
    force: bool,

    /// Never prompt; destructive operations then require --force.
    #[arg(long, global = true)]
    no_input: bool,
}

impl Common {
    pub fn log_level(&self) -> LevelFilter {
        self.log_level
    }

    pub fn config_dir(&self) -> &DisplayPath {
        &self.config_dir
    }

    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    pub fn json(&self) -> bool {
        self.json
    }

    pub fn force(&self) -> bool {
        self.force
    }

    pub fn no_input(&self) -> bool {
        self.no_input
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum AuthCommand {
    /// Store the OAuth client credentials downloaded from Google Cloud Console. Pass `-` to read
    /// them from stdin.
    Credentials(CredentialsArgs),
    /// Authorize an account with OAuth and store its refresh token.
    Add(AddArgs),
    /// List the services that can be authorized and their scopes.
    Services,
    /// List stored accounts (OAuth tokens and service accounts).
    List(ListArgs),
    /// Manage account aliases.
    #[command(subcommand)]
    Alias(AliasCommand),
    /// Show the config, the keyring backend and the resolved account.
    Status,
    /// Choose the secret store backend and save it in config.json.
    Keyring(KeyringArgs),
    /// Set the default account.
    Default(EmailArgs),
    /// Remove the stored OAuth token of an account.
    Remove(EmailArgs),
    /// Work with raw stored tokens.
    #[command(subcommand)]
    Tokens(TokensCommand),
    /// Open a local web page to add, remove and choose accounts.
    Manage(ManageArgs),
    /// Manage service account keys (Workspace domain-wide delegation).
    #[command(subcommand)]
    ServiceAccount(ServiceAccountCommand),
    /// Store a service account key for Google Keep, which cannot use OAuth.
    Keep(KeepArgs),
    /// Show which account commands act as, and why.
    Whoami,
}

/// (Not shown): Args for the `gog auth credentials` command.
#[derive(Debug, Parser, Clone)]
pub struct CredentialsArgs {
    /// Path to the client JSON file, or `-` for stdin.
    path: PathBuf,
}

impl CredentialsArgs {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// (Not shown): Args for the `gog auth add` command.
#[derive(Debug, Parser, Clone)]
pub struct AddArgs {
    /// The email of the account to authorize.
    email: String,

    /// Browserless flow: print the URL and paste the redirect URL back.
    #[arg(long)]
    manual: bool,

    /// Force the consent screen to obtain a refresh token.
    #[arg(long)]
    force_consent: bool,

    /// Services to authorize: user|all or a comma-separated list (see `gog auth services`).
    #[arg(long, default_value = "user")]
    services: String,

    /// Use read-only scopes where available.
    #[arg(long)]
    readonly: bool,

    /// Drive scope mode.
    #[arg(long, value_enum, default_value_t = DriveScope::Full)]
    drive_scope: DriveScope,

    /// Port for the local redirect listener; 0 picks a free port.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Print the authorization URL instead of opening a browser.
    #[arg(long)]
    no_browser: bool,

    /// How long to wait for the authorization, e.g. 90s, 5m.
    #[arg(long, default_value_t = DurationArg(DEFAULT_AUTHORIZE_TIMEOUT))]
    timeout: DurationArg,
}

impl AddArgs {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            manual: false,
            force_consent: false,
            services: "user".to_string(),
            readonly: false,
            drive_scope: DriveScope::Full,
            port: 0,
            no_browser: false,
            timeout: DurationArg(DEFAULT_AUTHORIZE_TIMEOUT),
        }
    }

    pub fn with_no_browser(mut self, no_browser: bool) -> Self {
        self.no_browser = no_browser;
        self
    }

    pub fn with_manual(mut self, manual: bool) -> Self {
        self.manual = manual;
        self
    }

    pub fn with_services(mut self, services: impl Into<String>) -> Self {
        self.services = services.into();
        self
    }

    pub fn with_readonly(mut self, readonly: bool, drive_scope: DriveScope) -> Self {
        self.readonly = readonly;
        self.drive_scope = drive_scope;
        self
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn manual(&self) -> bool {
        self.manual
    }

    pub fn force_consent(&self) -> bool {
        self.force_consent
    }

    pub fn services(&self) -> &str {
        &self.services
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn drive_scope(&self) -> DriveScope {
        self.drive_scope
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn no_browser(&self) -> bool {
        self.no_browser
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout
    }
}

/// (Not shown): Args for the `gog auth list` command.
#[derive(Debug, Parser, Clone)]
pub struct ListArgs {
    /// Verify each refresh token by exchanging it for an access token.
    #[arg(long)]
    check: bool,

    /// Per-token check timeout.
    #[arg(long, default_value_t = DurationArg(IDENTITY_TIMEOUT))]
    timeout: DurationArg,
}

impl ListArgs {
    pub fn check(&self) -> bool {
        self.check
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum AliasCommand {
    /// Map an alias to an email.
    Set(AliasSetArgs),
    /// Remove an alias.
    Unset(AliasNameArgs),
    /// List aliases.
    List,
}

/// (Not shown): Args for the `gog auth alias set` command.
#[derive(Debug, Parser, Clone)]
pub struct AliasSetArgs {
    alias: String,
    email: String,
}

impl AliasSetArgs {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn email(&self) -> &str {
        &self.email
    }
}

/// (Not shown): Args for the `gog auth alias unset` command.
#[derive(Debug, Parser, Clone)]
pub struct AliasNameArgs {
    alias: String,
}

impl AliasNameArgs {
    pub fn alias(&self) -> &str {
        &self.alias
    }
}

/// (Not shown): Args for the `gog auth keyring` command.
#[derive(Debug, Parser, Clone)]
pub struct KeyringArgs {
    /// The backend to use.
    #[arg(value_enum)]
    backend: KeyringBackend,
}

impl KeyringArgs {
    pub fn backend(&self) -> KeyringBackend {
        self.backend
    }
}

/// (Not shown): Args for commands that take one email.
#[derive(Debug, Parser, Clone)]
pub struct EmailArgs {
    email: String,
}

impl EmailArgs {
    pub fn email(&self) -> &str {
        &self.email
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum TokensCommand {
    /// List the raw keys in the secret store.
    List,
    /// Delete the stored token of an account.
    Delete(EmailArgs),
    /// Write the token of an account to a file. The file contains a secret!
    Export(ExportArgs),
    /// Read a token file written by `export` into the secret store.
    Import(ImportArgs),
}

/// (Not shown): Args for the `gog auth tokens export` command.
#[derive(Debug, Parser, Clone)]
pub struct ExportArgs {
    email: String,

    /// Where to write the token file.
    #[arg(long)]
    out: PathBuf,

    /// Replace the output file if it exists.
    #[arg(long)]
    overwrite: bool,
}

impl ExportArgs {
    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn out(&self) -> &Path {
        &self.out
    }

    pub fn overwrite(&self) -> bool {
        self.overwrite
    }
}

/// (Not shown): Args for the `gog auth tokens import` command.
#[derive(Debug, Parser, Clone)]
pub struct ImportArgs {
    /// The token file, or `-` for stdin.
    path: PathBuf,
}

impl ImportArgs {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// (Not shown): Args for the `gog auth manage` command.
#[derive(Debug, Parser, Clone)]
pub struct ManageArgs {
    /// Services to authorize for accounts added from the page.
    #[arg(long, default_value = "user")]
    services: String,

    /// Force the consent screen to obtain a refresh token.
    #[arg(long)]
    force_consent: bool,

    /// How long the server runs, e.g. 10m.
    #[arg(long, default_value_t = DurationArg(DEFAULT_MANAGE_TIMEOUT))]
    timeout: DurationArg,

    /// Port to listen on; 0 picks a free port.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Print the page URL instead of opening a browser.
    #[arg(long)]
    no_browser: bool,
}

impl ManageArgs {
    pub fn new(services: impl Into<String>, timeout: Duration) -> Self {
        Self {
            services: services.into(),
            force_consent: false,
            timeout: DurationArg(timeout),
            port: 0,
            no_browser: true,
        }
    }

    pub fn services(&self) -> &str {
        &self.services
    }

    pub fn force_consent(&self) -> bool {
        self.force_consent
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn no_browser(&self) -> bool {
        self.no_browser
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum ServiceAccountCommand {
    /// Store a service account key to impersonate an account.
    Set(ServiceAccountSetArgs),
    /// Delete the service account keys of an account.
    Unset(EmailArgs),
    /// Show which service account key would be used for an account.
    Status(EmailArgs),
}

/// (Not shown): Args for the `gog auth service-account set` command.
#[derive(Debug, Parser, Clone)]
pub struct ServiceAccountSetArgs {
    /// The account to impersonate.
    email: String,

    /// The service account JSON key, or `-` for stdin.
    #[arg(long)]
    key: PathBuf,
}

impl ServiceAccountSetArgs {
    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn key(&self) -> &Path {
        &self.key
    }
}

/// (Not shown): Args for the `gog auth keep` command.
pub type KeepArgs = ServiceAccountSetArgs;

/// A duration given as a number with an optional `s`, `m` or `h` suffix (seconds by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationArg(Duration);

impl Deref for DurationArg {
    type Target = Duration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for DurationArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let secs = self.0.as_secs();
        if secs != 0 && secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs != 0 && secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{secs}s")
        }
    }
}

impl FromStr for DurationArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let invalid = || format!("invalid duration '{s}', expected e.g. 30s, 5m or 1h");
        if raw.is_empty() {
            return Err(invalid());
        }
        let (value, unit) = match raw.char_indices().last() {
            Some((i, c)) if c.is_ascii_alphabetic() => (&raw[..i], &raw[i..]),
            _ => (raw, "s"),
        };
        let value: u64 = value.trim().parse().map_err(|_| invalid())?;
        let secs = match unit {
            "s" => value,
            "m" => value.checked_mul(60).ok_or_else(invalid)?,
            "h" => value.checked_mul(60 * 60).ok_or_else(invalid)?,
            _ => return Err(invalid()),
        };
        if secs == 0 {
            return Err(invalid());
        }
        Ok(Self(Duration::from_secs(secs)))
    }
}

fn default_config_dir() -> DisplayPath {
    DisplayPath(match dirs::config_dir() {
        Some(dir) => dir.join("gogcli"),
        None => {
            error!(
                "There was an error when trying to get your config directory. You can get around \
                this by providing --config-dir or GOG_CONFIG_DIR. If you continue using the \
                program right now, you may have problems!",
            );
            PathBuf::from("gogcli")
        }
    })
}

#[derive(Debug, Default, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DisplayPath(PathBuf);

impl From<PathBuf> for DisplayPath {
    fn from(value: PathBuf) -> Self {
        DisplayPath(value)
    }
}

impl Deref for DisplayPath {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<Path> for DisplayPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl Display for DisplayPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_string_lossy())
    }
}

impl FromStr for DisplayPath {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(PathBuf::from(s)))
    }
}

impl DisplayPath {
    pub fn path(&self) -> &Path {
        &self.0
    }
}
