//! Produce blocks for a single shard with in-memory collaborators.
//!
//! The node seeds its pool with transactions, produces a block every interval until the
//! requested number of blocks are persisted, and can then export the persisted chain.
//!
//! # Usage
//!
//! ```sh
//! cargo run --release --bin shardchain -- --shard 1 --blocks 20 --interval 200 --transactions 64
//! ```
//!
//! ## Export
//!
//! ```sh
//! cargo run --release --bin shardchain -- --blocks 20 --export /tmp/shard-1.bin --compression 3
//! ```

use clap::{value_parser, Arg, ArgAction, Command};
use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt};
use commonware_runtime::{tokio, Clock, Metrics, Runner};
use shardchain::{
    export, memory, solo,
    types::{ShardId, Transaction},
    Keystore, Ledger as _,
};
use std::{
    fs::File,
    io::{BufWriter, Write},
    time::Duration,
};

/// Unique namespace to avoid message replay attacks.
const NAMESPACE: &[u8] = b"_SHARDCHAIN";

fn main() {
    // Parse arguments
    let matches = Command::new("shardchain")
        .about("produce and finalize blocks for a single shard")
        .arg(
            Arg::new("shard")
                .long("shard")
                .default_value("1")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .default_value("0")
                .value_parser(value_parser!(u64))
                .help("Seed of the block signing key"),
        )
        .arg(
            Arg::new("blocks")
                .long("blocks")
                .default_value("10")
                .value_parser(value_parser!(u64))
                .help("Number of blocks to persist before stopping"),
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .default_value("200")
                .value_parser(value_parser!(u64))
                .help("Milliseconds between produced blocks"),
        )
        .arg(
            Arg::new("transactions")
                .long("transactions")
                .default_value("32")
                .value_parser(value_parser!(u64))
                .help("Number of transactions to seed the pool with"),
        )
        .arg(Arg::new("export").long("export").required(false))
        .arg(
            Arg::new("compression")
                .long("compression")
                .required(false)
                .value_parser(value_parser!(u8))
                .help("zstd level applied to exported blocks"),
        )
        .arg(
            Arg::new("strip-signatures")
                .long("strip-signatures")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    // Create logger
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load configuration
    let shard = ShardId::new(*matches.get_one::<u64>("shard").expect("shard has a default"));
    let signer = PrivateKey::from_seed(*matches.get_one::<u64>("seed").expect("seed has a default"));
    let blocks = *matches.get_one::<u64>("blocks").expect("blocks has a default");
    let interval = Duration::from_millis(
        *matches
            .get_one::<u64>("interval")
            .expect("interval has a default"),
    );
    let transactions = *matches
        .get_one::<u64>("transactions")
        .expect("transactions has a default");
    let destination = matches.get_one::<String>("export").cloned();
    let compression = matches.get_one::<u8>("compression").copied();
    let strip_signatures = matches.get_flag("strip-signatures");
    tracing::info!(%shard, key = ?signer.public_key(), blocks, ?interval, "loaded configuration");

    // Run the node
    let executor = tokio::Runner::default();
    executor.start(|context| async move {
        let ledger = memory::Ledger::new(shard);
        let pool = memory::Pool::new();
        for nonce in 0..transactions {
            pool.submit(Transaction::new(nonce, nonce.to_be_bytes().to_vec()));
        }

        let (actor, mut mailbox) = solo::Actor::new(
            context.with_label("solo"),
            solo::Config {
                ledger: ledger.clone(),
                pool: pool.clone(),
                keystore: signer,
                broadcaster: memory::Relay::new(),
                reporter: pool.clone(),
                shard,
                namespace: NAMESPACE.to_vec(),
                mailbox_size: 1024,
                interval,
                window_capacity: shardchain::window::DEFAULT_CAPACITY,
                pending_capacity: shardchain::store::DEFAULT_CAPACITY,
            },
        );
        actor.start();
        mailbox.start().await.expect("actor closed");
        while ledger.height() < blocks {
            context.sleep(interval).await;
        }
        mailbox.stop().await.expect("actor closed");
        tracing::info!(
            height = ledger.height(),
            pending = pool.len(),
            "finished producing"
        );

        // Export the persisted chain (if requested)
        let Some(destination) = destination else {
            return;
        };
        let file = File::create(&destination).expect("failed to create export file");
        let mut writer = BufWriter::new(file);
        let metadata = export::export(
            &ledger,
            &mut writer,
            &export::Config {
                start: 1,
                end: None,
                compression,
                strip_signatures,
            },
        )
        .expect("failed to export blocks");
        writer.flush().expect("failed to flush export");
        tracing::info!(
            %destination,
            start = metadata.start,
            end = metadata.end,
            "exported blocks"
        );
    });
}
