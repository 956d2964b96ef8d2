//! Signer command-line tool.
//!
//! Opens an HSM session from a signer config file and runs one operation
//! against it: show the validator identity, check the session, or (with the
//! `provisioning` feature) import a signing key.

use aiakos::{
    HsmSigner, PrivValidator, Service, SignerConfig, SignerError, SignerIdentity, TcpChannel,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "provisioning")]
use aiakos::protocol::KeyId;
#[cfg(feature = "provisioning")]
use zeroize::Zeroizing;

/// HSM-backed validator signer.
#[derive(Parser, Debug)]
#[command(name = "aiakos")]
#[command(about = "Validator signer backed by a networked HSM")]
#[command(version)]
struct Args {
    /// Path to signer config file (JSON)
    #[arg(long, default_value = "signer.json")]
    config: PathBuf,

    /// HSM password, overrides the config file (or use AIAKOS_HSM_PASSWORD env var)
    #[arg(long, env = "AIAKOS_HSM_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Session read/write timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print the validator address derived from the HSM public key
    Address,

    /// Print the hex-encoded Ed25519 public key
    Pubkey,

    /// Check the HSM session with an echo round trip
    Ping {
        /// Payload to echo
        #[arg(long, default_value = "aiakos")]
        data: String,
    },

    /// Import an Ed25519 seed into an HSM slot
    #[cfg(feature = "provisioning")]
    ImportKey {
        /// Destination slot
        #[arg(long)]
        key_id: KeyId,

        /// Hex-encoded 32-byte seed (or use AIAKOS_SIGNING_KEY_SEED env var)
        #[arg(long, env = "AIAKOS_SIGNING_KEY_SEED", hide_env_values = true)]
        seed: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let identity = match load_identity(&args.config, args.password) {
        Ok(identity) => identity,
        Err(e) => {
            error!("Failed to load config {:?}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    info!("HSM address: {}", identity.hsm_addr());
    info!("Signing key: 0x{:04x}", identity.signing_key_id());

    let channel = TcpChannel::with_timeout(Duration::from_secs(args.timeout_secs));
    let signer = HsmSigner::new(channel, identity);

    if let Err(e) = signer.start() {
        error!("Failed to start signer: {}", e);
        std::process::exit(1);
    }

    let result = run(&signer, args.command);
    signer.stop();

    if let Err(e) = result {
        if e.is_fatal() {
            error!("Fatal signer error: {}", e);
        } else {
            error!("Command failed: {}", e);
        }
        std::process::exit(1);
    }
}

fn load_identity(
    path: &PathBuf,
    password: Option<String>,
) -> Result<SignerIdentity, aiakos::ConfigError> {
    SignerConfig::load(path)?.into_identity(password)
}

fn run(signer: &HsmSigner<TcpChannel>, command: Cmd) -> Result<(), SignerError> {
    match command {
        Cmd::Address => {
            println!("{}", signer.address()?);
        }
        Cmd::Pubkey => {
            println!("{}", signer.pub_key()?);
        }
        Cmd::Ping { data } => {
            signer.ping(data.as_bytes())?;
            println!("ok");
        }
        #[cfg(feature = "provisioning")]
        Cmd::ImportKey { key_id, seed } => {
            let seed = match hex::decode(seed.trim()) {
                Ok(bytes) => Zeroizing::new(bytes),
                Err(e) => {
                    error!("Invalid seed hex: {}", e);
                    signer.stop();
                    std::process::exit(1);
                }
            };
            signer.import_key(key_id, &seed)?;
            println!("imported into slot 0x{:04x}", key_id);
        }
    }
    Ok(())
}
