use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use clap::Parser;

#[derive(Parser, Debug)]
struct Cli {
    /// Working directory, with config and data files.
    #[clap(short, long, default_value = "data")]
    dir: PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(clap::Subcommand, Debug)]
enum Cmd {
    /// Run the HTTP server.
    Server,

    /// Mint an access token for the given user email.
    Jwt { email: String, ttl: f64 },

    /// Overwrite a user's password.
    SetPassword { email: String, password: String },

    /// Delete usage-ledger rows older than the given number of days.
    PurgeUsage { days: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    human_panic_setup();
    let cli = Cli::parse();
    set_current_dir(&cli.dir)?;
    kvota::tracing::init()?;
    tracing::debug!(?cli, "Starting.");
    match &cli.cmd {
        Cmd::Server => kvota::server::run().await,
        Cmd::Jwt { email, ttl } => {
            let conf = kvota::conf::global();
            let claims = kvota::auth::Claims::new(
                email,
                Duration::from_secs_f64(*ttl),
                &conf.jwt,
            )?;
            let encoded: String = claims.to_str(&conf.jwt)?;
            println!("{encoded}");
            Ok(())
        }
        Cmd::SetPassword { email, password } => {
            let conf = kvota::conf::global();
            let storage = kvota::data::Storage::connect().await?;
            let Some(user) = storage.user_by_email(email).await? else {
                bail!("No user with email {email:?}");
            };
            let hash =
                kvota::auth::hash_password(password, conf.bcrypt_cost)?;
            storage.set_password(user.id, &hash).await?;
            println!("Password updated for {email}.");
            Ok(())
        }
        Cmd::PurgeUsage { days } => {
            let storage = kvota::data::Storage::connect().await?;
            let deleted = storage.purge_usage_older_than(*days).await?;
            println!("Deleted {deleted} usage-log rows older than {days} days.");
            Ok(())
        }
    }
}

fn set_current_dir(path: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(path)
        .context(format!("Failed to create directory path: {path:?}"))?;
    env::set_current_dir(path)
        .context(format!("Failed to set current directory to {path:?}"))?;
    Ok(())
}

fn human_panic_setup() {
    macro_rules! repo {
        () => {
            env!("CARGO_PKG_REPOSITORY")
        };
    }
    human_panic::setup_panic!(human_panic::Metadata::new(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
    .authors(env!("CARGO_PKG_AUTHORS"))
    .homepage(repo!())
    .support(concat!("- Submit an issue at ", repo!(), "/issues")));
}
