use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use offload_core::handlers::{
    RecordCipherContext, SigningKeyContext, SoftwareRecordCipher, SoftwareRsa,
};
use offload_core::keys::traffic_secret;
use offload_core::logging::CallbackLayer;
use offload_core::{
    capabilities, describe_status, CallbackContext, ContentType, FallbackPolicy, Handler,
    OffloadConfig, OffloadError, OperationKind, SessionId, SessionTable, TrafficKeys,
};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::EncodePublicKey;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::{info, warn, Level};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "offload-cli")]
#[command(about = "Drive a simulated TLS engine through the crypto offload seam", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show which reference handler families are compiled in
    Capabilities,

    /// Describe an offload status code
    DescribeStatus {
        #[arg(allow_hyphen_values = true)]
        code: i32,
    },

    /// Print the default configuration
    DefaultConfig,

    /// Run an RSA handshake step and a record exchange between two sessions
    Demo {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Forward engine log events through the logging callback
        #[arg(long)]
        debug: bool,
    },
}

fn init_tracing(filter: &str, debug: bool) {
    let (callback, switch) = CallbackLayer::new(|level: Level, msg: &str| {
        eprintln!("[offload {level}] {msg}");
    });
    if debug {
        switch.on();
    }
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(callback)
        .init();
}

/// Resolve a `NotRegistered` result according to the fallback policy.
fn offload_or_builtin<T>(
    policy: FallbackPolicy,
    result: Result<T, OffloadError>,
    builtin: impl FnOnce() -> Result<T>,
) -> Result<T> {
    match result {
        Err(OffloadError::NotRegistered(kind)) => match policy {
            FallbackPolicy::BuiltIn => {
                info!(%kind, "not offloaded, using built-in implementation");
                builtin()
            }
            FallbackPolicy::FailHandshake => {
                bail!("{kind} is not offloaded and the fallback policy is fail_handshake")
            }
        },
        other => other.map_err(|e| {
            let code = e.status_code();
            anyhow::Error::new(e).context(format!("offloaded operation failed with status {code}"))
        }),
    }
}

fn register_offloads(
    table: &mut SessionTable,
    id: SessionId,
    config: &OffloadConfig,
    records: &CallbackContext<RecordCipherContext>,
) -> Result<()> {
    let session = table.session_mut(id)?;
    for kind in &config.offload {
        let handler = match kind {
            OperationKind::RsaPublicEncrypt => Handler::rsa_public_encrypt(SoftwareRsa),
            OperationKind::RsaSign => Handler::rsa_sign(SoftwareRsa),
            OperationKind::RsaVerify => Handler::rsa_verify(SoftwareRsa),
            OperationKind::AtomicRecordEncrypt => Handler::atomic_record_encrypt(SoftwareRecordCipher),
            OperationKind::AtomicRecordDecrypt => Handler::atomic_record_decrypt(SoftwareRecordCipher),
        };
        session.register(handler)?;
        if kind.requires_context() {
            session.attach(*kind, records)?;
        }
    }
    Ok(())
}

fn run_demo(config: &OffloadConfig) -> Result<serde_json::Value> {
    let server_key = RsaPrivateKey::new(&mut OsRng, 2048).context("generating server RSA key")?;
    let server_public = RsaPublicKey::from(&server_key);
    let server_der = server_public
        .to_public_key_der()
        .context("encoding server public key")?
        .as_bytes()
        .to_vec();

    let mut table = SessionTable::new();
    let client = table.open();
    let server = table.open();
    let client_records = CallbackContext::new(RecordCipherContext::new());
    let server_records = CallbackContext::new(RecordCipherContext::new());
    register_offloads(&mut table, client, config, &client_records)?;
    register_offloads(&mut table, server, config, &server_records)?;
    if config.offloads(OperationKind::RsaSign) {
        let signer = CallbackContext::new(SigningKeyContext::new(server_key.clone()));
        table
            .session_mut(server)?
            .attach(OperationKind::RsaSign, &signer)?;
    }

    // Client: encrypt the premaster secret to the server key.
    let mut premaster = [0u8; 32];
    OsRng.fill_bytes(&mut premaster);
    let mut encrypted = vec![0u8; 256];
    let result = table
        .session(client)?
        .rsa_public_encrypt(&premaster, &server_der, &mut encrypted);
    let n = offload_or_builtin(config.fallback, result, || {
        let ciphertext = server_public.encrypt(&mut OsRng, Pkcs1v15Encrypt, &premaster)?;
        encrypted[..ciphertext.len()].copy_from_slice(&ciphertext);
        Ok(ciphertext.len())
    })?;
    encrypted.truncate(n);

    let recovered = server_key
        .decrypt(Pkcs1v15Encrypt, &encrypted)
        .context("server could not recover premaster")?;
    if recovered != premaster {
        bail!("premaster mismatch after RSA transport");
    }

    // Server: sign the transcript; client: verify it.
    let mut signature = vec![0u8; 256];
    let result = table
        .session(server)?
        .rsa_sign(&encrypted, &server_der, &mut signature);
    let n = offload_or_builtin(config.fallback, result, || {
        let sig = SigningKey::<Sha256>::new(server_key.clone())
            .try_sign(&encrypted)?
            .to_bytes();
        signature[..sig.len()].copy_from_slice(&sig);
        Ok(sig.len())
    })?;
    signature.truncate(n);

    let result = table
        .session(client)?
        .rsa_verify(&encrypted, &signature, &server_der);
    offload_or_builtin(config.fallback, result, || {
        let sig = Signature::try_from(signature.as_slice())?;
        VerifyingKey::<Sha256>::new(server_public.clone()).verify(&encrypted, &sig)?;
        Ok(())
    })?;

    // Key schedule.
    let c2s = TrafficKeys::derive(config.cipher, &*traffic_secret(&premaster, b"c ap traffic")?)?;
    let s2c = TrafficKeys::derive(config.cipher, &*traffic_secret(&premaster, b"s ap traffic")?)?;
    {
        let session = table.session_mut(client)?;
        session.install_write_keys(c2s.clone())?;
        session.install_read_keys(s2c.clone())?;
    }
    {
        let session = table.session_mut(server)?;
        session.install_write_keys(s2c)?;
        session.install_read_keys(c2s)?;
    }

    let records = exchange_records(&mut table, client, server, config)?;

    let summary = serde_json::json!({
        "client": client,
        "server": server,
        "cipher": config.cipher,
        "premaster_ciphertext_len": encrypted.len(),
        "signature_len": signature.len(),
        "records": records,
    });
    table.teardown(client)?;
    table.teardown(server)?;
    Ok(summary)
}

fn exchange_records(
    table: &mut SessionTable,
    client: SessionId,
    server: SessionId,
    config: &OffloadConfig,
) -> Result<serde_json::Value> {
    let offloaded = config.offloads(OperationKind::AtomicRecordEncrypt)
        && config.offloads(OperationKind::AtomicRecordDecrypt);
    if !offloaded {
        return match config.fallback {
            FallbackPolicy::BuiltIn => {
                info!("record protection is not offloaded, leaving it to the engine");
                Ok(serde_json::Value::Null)
            }
            FallbackPolicy::FailHandshake => {
                bail!("record protection is not offloaded and the fallback policy is fail_handshake")
            }
        };
    }

    let mut sent = Vec::with_capacity(config.records);
    let mut wire = vec![0u8; 512];
    let mut plain = vec![0u8; 512];
    for i in 0..config.records {
        let message = format!("application record {i}");
        let n = table.session_mut(client)?.encrypt_record(
            ContentType::ApplicationData,
            message.as_bytes(),
            &mut wire,
        )?;
        let m = table.session_mut(server)?.decrypt_record(
            ContentType::ApplicationData,
            &wire[..n],
            &mut plain,
        )?;
        if &plain[..m] != message.as_bytes() {
            bail!("record {i} did not round-trip");
        }
        sent.push(hex::encode(&wire[..n]));
    }

    // One tampered record: rejected, then the genuine copy still decrypts.
    let n = table.session_mut(client)?.encrypt_record(
        ContentType::ApplicationData,
        b"tamper probe",
        &mut wire,
    )?;
    let mut tampered = wire[..n].to_vec();
    tampered[0] ^= 0x01;
    let rejected = match table.session_mut(server)?.decrypt_record(
        ContentType::ApplicationData,
        &tampered,
        &mut plain,
    ) {
        Ok(_) => bail!("tampered record was accepted"),
        Err(e) => {
            warn!("tampered record rejected: {e}");
            e.status_code()
        }
    };
    table
        .session_mut(server)?
        .decrypt_record(ContentType::ApplicationData, &wire[..n], &mut plain)
        .context("genuine record after tamper")?;

    Ok(serde_json::json!({
        "sent": sent,
        "tamper_status": rejected,
        "tamper_description": describe_status(rejected),
    }))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Capabilities => {
            println!("{}", serde_json::to_string_pretty(&capabilities())?);
        }
        Commands::DescribeStatus { code } => {
            println!("{code}: {}", describe_status(code));
        }
        Commands::DefaultConfig => {
            println!("{}", OffloadConfig::default().to_json()?);
        }
        Commands::Demo { config, debug } => {
            let config = match config {
                Some(path) => OffloadConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => OffloadConfig::default(),
            };
            init_tracing(&config.log_filter, debug);
            let summary = run_demo(&config)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
