//! HSM emulator binary.
//!
//! Runs the emulated HSM on a TCP socket so a validator can be wired up
//! against the signer without hardware.

use aiakos::protocol::KeyId;
use aiakos::{HsmServer, HsmServerConfig, Password};
use clap::Parser;
use ed25519_dalek::SigningKey;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

/// Emulated HSM for Aiakos validator signers.
#[derive(Parser, Debug)]
#[command(name = "aiakos-hsm-emulator")]
#[command(about = "Emulated HSM speaking the Aiakos session protocol")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:12345")]
    listen: String,

    /// Authentication key slot
    #[arg(long, default_value_t = 1)]
    auth_key_id: KeyId,

    /// Authentication password (or use AIAKOS_HSM_PASSWORD env var)
    #[arg(long, env = "AIAKOS_HSM_PASSWORD", hide_env_values = true)]
    password: String,

    /// Slot to load the signing key into
    #[arg(long, requires = "signing_key_seed")]
    signing_key_id: Option<KeyId>,

    /// Hex-encoded 32-byte Ed25519 seed (or use AIAKOS_SIGNING_KEY_SEED env var)
    #[arg(
        long,
        env = "AIAKOS_SIGNING_KEY_SEED",
        hide_env_values = true,
        requires = "signing_key_id"
    )]
    signing_key_seed: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Starting aiakos-hsm-emulator");
    info!("Listen address: {}", args.listen);
    info!("Auth key: 0x{:04x}", args.auth_key_id);

    let signing_keys = match signing_key(args.signing_key_id, args.signing_key_seed.as_deref()) {
        Ok(Some((key_id, seed))) => {
            let pubkey = SigningKey::from_bytes(&seed).verifying_key();
            info!(
                "Loaded signing key into slot 0x{:04x}, pubkey: {}",
                key_id,
                hex::encode(pubkey.as_bytes())
            );
            vec![(key_id, seed)]
        }
        Ok(None) => {
            info!("No signing key loaded; use import-key to provision one");
            Vec::new()
        }
        Err(e) => {
            error!("Invalid signing key: {}", e);
            std::process::exit(1);
        }
    };

    let config = HsmServerConfig {
        listen_addr: args.listen,
        auth_keys: vec![(args.auth_key_id, Password::new(args.password))],
        signing_keys,
    };

    let server = match HsmServer::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create server: {}", e);
            std::process::exit(1);
        }
    };

    info!("HSM emulator ready, waiting for sessions...");

    if let Err(e) = server.run() {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

/// Slot and seed for the preloaded signing key. Both or neither must be set.
fn signing_key(
    key_id: Option<KeyId>,
    seed_hex: Option<&str>,
) -> Result<Option<(KeyId, Zeroizing<[u8; 32]>)>, String> {
    match (key_id, seed_hex) {
        (Some(key_id), Some(seed_hex)) => Ok(Some((key_id, parse_seed(seed_hex)?))),
        (None, None) => Ok(None),
        (Some(_), None) => Err("--signing-key-id given without a seed".to_string()),
        (None, Some(_)) => Err("signing key seed given without --signing-key-id".to_string()),
    }
}

fn parse_seed(seed_hex: &str) -> Result<Zeroizing<[u8; 32]>, String> {
    let bytes = Zeroizing::new(hex::decode(seed_hex.trim()).map_err(|e| e.to_string())?);
    let mut seed = Zeroizing::new([0u8; 32]);
    if bytes.len() != seed.len() {
        return Err(format!("expected 32 bytes, got {}", bytes.len()));
    }
    seed.copy_from_slice(&bytes);
    Ok(seed)
}
