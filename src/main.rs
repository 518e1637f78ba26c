use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use purchases_core::config::{Config, VerificationSetting};
use purchases_core::error::{PurchasesError, Result};
use purchases_core::id::generate_anonymous_id;
use purchases_core::logging;
use purchases_core::verification::{create_random_nonce, VerificationResult};
use purchases_core::Purchases;

#[derive(Parser, Debug)]
#[command(name = "purchases")]
#[command(about = "Diagnostics for the purchases core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a fresh request nonce
    Nonce,

    /// Print a freshly generated anonymous app user id
    AnonymousId,

    /// Verify a signed response against a public key
    Verify {
        /// Base64 Ed25519 public key (default: PURCHASES_PUBLIC_KEY)
        #[arg(long)]
        public_key: Option<String>,

        /// Value of the X-Signature response header
        #[arg(long)]
        signature: String,

        /// Nonce sent with the request
        #[arg(long)]
        nonce: String,

        /// Value of the X-RevenueCat-Request-Time response header
        #[arg(long)]
        timestamp: String,

        /// File holding the exact response body
        #[arg(long, conflicts_with = "etag")]
        body_file: Option<PathBuf>,

        /// ETag of a 304 response
        #[arg(long)]
        etag: Option<String>,

        /// Request path, for log output only
        #[arg(long, default_value = "/")]
        path: String,
    },

    /// Dump the subscriber attributes persisted in a storage directory
    Attributes {
        /// Storage directory (default: PURCHASES_STORAGE_DIR)
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Only show this user
        #[arg(long)]
        user: Option<String>,
    },

    /// Configure from the environment and fetch the current user's entitlements
    CustomerInfo,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(logging::DEFAULT_FILTER);

    match run(cli.command).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command succeeded.
async fn run(command: Command) -> Result<bool> {
    match command {
        Command::Nonce => {
            println!("{}", create_random_nonce());
            Ok(true)
        }
        Command::AnonymousId => {
            println!("{}", generate_anonymous_id());
            Ok(true)
        }
        Command::Verify {
            public_key,
            signature,
            nonce,
            timestamp,
            body_file,
            etag,
            path,
        } => {
            let config = Config::from_env()?;
            let public_key = public_key.or(config.public_key);
            let mode = VerificationSetting::Enforced.into_mode(public_key.as_deref())?;
            let body = body_file
                .map(|file| {
                    std::fs::read_to_string(&file).map_err(|e| {
                        PurchasesError::configuration(format!("{}: {}", file.display(), e))
                    })
                })
                .transpose()?;

            let Some(verifier) = mode.verifier() else {
                return Ok(false);
            };
            let result = verifier.verify_response(
                &path,
                Some(signature.as_str()),
                &nonce,
                body.as_deref(),
                Some(timestamp.as_str()),
                etag.as_deref(),
            );
            println!("{}", serde_json::to_string(&result)?);
            Ok(result == VerificationResult::Verified)
        }
        Command::Attributes { dir, user } => {
            let config = Config::from_env()?;
            let dir = dir.or(config.storage_dir).ok_or_else(|| {
                PurchasesError::configuration(
                    "no storage directory, pass --dir or set PURCHASES_STORAGE_DIR",
                )
            })?;
            dump_attributes(&dir, &config.api_key, user.as_deref())
        }
        Command::CustomerInfo => {
            let config = Config::from_env()?;
            let api_key = config.api_key.clone();
            let purchases = Purchases::new(&api_key, config.into_options()?).await?;
            let info = purchases.customer_info().await?;

            let summary = serde_json::json!({
                "app_user_id": purchases.app_user_id(),
                "is_anonymous": purchases.is_anonymous(),
                "original_app_user_id": info.original_app_user_id,
                "active_entitlements": info.active_entitlements(),
                "verification": info.verification,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(true)
        }
    }
}

#[cfg(feature = "file-storage")]
fn dump_attributes(dir: &std::path::Path, api_key: &str, user: Option<&str>) -> Result<bool> {
    use purchases_core::attributes::AttributeStore;
    use purchases_core::storage::FileStorage;

    let storage = std::sync::Arc::new(FileStorage::open(dir)?);
    let store = AttributeStore::new(storage, api_key);
    let output = match user {
        Some(user) => serde_json::to_string_pretty(&store.attributes_for(user)?)?,
        None => serde_json::to_string_pretty(&store.all_attributes()?)?,
    };
    println!("{}", output);
    Ok(true)
}

#[cfg(not(feature = "file-storage"))]
fn dump_attributes(_dir: &std::path::Path, _api_key: &str, _user: Option<&str>) -> Result<bool> {
    Err(PurchasesError::configuration("built without the file-storage feature"))
}
