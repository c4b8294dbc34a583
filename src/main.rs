use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use primitive_types::U256;
use rand::rngs::OsRng;
use tokio::sync::watch;

use powchain::config::{init_logging, NodeConfig};
use powchain::consensus::Sha256Pow;
use powchain::runtime::Runtime;
use powchain::signer::sign_transaction;
use powchain::storage::SledStorage;
use powchain::types::{format_hex, Address, PublicKey, Transaction, TxCommon};

#[derive(Parser)]
#[command(name = "powchain", version, about = "Proof-of-work account chain node")]
struct Cli {
    /// JSON node configuration
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Overrides the configured database directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Overrides the configured sealing thread count
    #[arg(long, allow_negative_numbers = true)]
    threads: Option<i64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a signing key and print its address
    Keygen,
    /// Seal blocks from the pending transactions
    Mine {
        #[arg(long, default_value_t = 1)]
        blocks: u64,
    },
    /// Sign and submit a transfer, then mine a block including it
    Transfer {
        /// Hex-encoded 32-byte secret key
        #[arg(long)]
        key: String,
        #[arg(long)]
        to: Address,
        #[arg(long, value_parser = parse_amount)]
        amount: U256,
        #[arg(long, value_parser = parse_amount, default_value = "1")]
        fee: U256,
        /// Defaults to the sender's current nonce
        #[arg(long)]
        nonce: Option<u64>,
    },
    /// Print an account balance and nonce
    Balance { address: Address },
    /// Print the full account state as JSON
    Dump,
}

fn parse_amount(s: &str) -> Result<U256, String> {
    U256::from_dec_str(s).map_err(|e| format!("invalid amount {s:?}: {e:?}"))
}

fn parse_key(s: &str) -> Result<SigningKey, Box<dyn std::error::Error>> {
    let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| "secret key must be 32 bytes")?;
    Ok(SigningKey::from_bytes(&bytes))
}

type Node = Runtime<SledStorage, Sha256Pow>;

/// Mines `count` blocks, or fewer if interrupted.
async fn mine(runtime: &Node, count: u64) -> Result<(), Box<dyn std::error::Error>> {
    let (stop_tx, mut stop) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping sealer");
            stop_tx.send(true).ok();
        }
    });

    for _ in 0..count {
        match runtime.produce_block(&mut stop).await? {
            Some(block) => println!(
                "Block #{} ({}) sealed with {} transaction(s).",
                block.number(),
                format_hex(&block.hash()),
                block.transactions.len()
            ),
            None => {
                println!("Sealing interrupted.");
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if cli.threads.is_some() {
        config.sealer.threads = cli.threads;
    }
    init_logging(&config.log_filter)?;

    if let Command::Keygen = cli.command {
        let mut secret = [0u8; 32];
        rand::Rng::fill(&mut OsRng, &mut secret);
        let key = SigningKey::from_bytes(&secret);
        let address = Address::from_public_key(&PublicKey::from(key.verifying_key()));
        println!("secret:  {}", hex::encode(secret));
        println!("address: {address}");
        return Ok(());
    }

    let storage = Arc::new(SledStorage::new(&config.data_dir)?);
    let runtime = Runtime::new(Arc::clone(&storage), Sha256Pow, &config)?;

    match cli.command {
        Command::Keygen => {}
        Command::Mine { blocks } => mine(&runtime, blocks).await?,
        Command::Transfer { key, to, amount, fee, nonce } => {
            let key = parse_key(&key)?;
            let sender = PublicKey::from(key.verifying_key());
            let nonce = match nonce {
                Some(nonce) => nonce,
                None => runtime.nonce(&Address::from_public_key(&sender))?,
            };
            let common = TxCommon::new(config.chain_id, sender, nonce, fee);
            let tx = Transaction::transfer(common, to, amount);
            let tx = sign_transaction(runtime.signer(), &tx, &key)?;
            let hash = runtime.submit_transaction(tx)?;
            println!("Transaction {} submitted.", format_hex(&hash));
            mine(&runtime, 1).await?;
        }
        Command::Balance { address } => {
            let balance = runtime.balance(&address)?;
            println!("{address}: balance {balance} nonce {}", runtime.nonce(&address)?);
        }
        Command::Dump => {
            println!("{}", serde_json::to_string_pretty(&runtime.dump_state()?)?);
        }
    }

    storage.flush()?;
    Ok(())
}
