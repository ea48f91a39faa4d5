//! BlobVault CLI - talk to a BlobVault server from the shell

mod client;

use anyhow::Context;
use blobvault_core::codec::{
    self, decode_timestamp, encode_timestamp, escape_segment, unescape_segment,
};
use clap::{Parser, Subcommand};
use client::{BlobAddress, BlobClient};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "blobvault-cli", version, about = "BlobVault command-line client")]
struct Cli {
    /// Server base URL
    #[arg(long, default_value = "http://127.0.0.1:8086")]
    server: String,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload a blob; prints the node and id needed to fetch it
    Post {
        /// File to upload, stdin when omitted
        file: Option<PathBuf>,
        /// Unix timestamp (seconds) of the blob, now when omitted
        #[arg(long)]
        at: Option<i64>,
    },
    /// Download a blob by node and id (as printed by `post`)
    Get {
        node: String,
        id: String,
        /// Write to this file instead of stdout
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Drop every day before the given Unix timestamp
    Expire {
        #[arg(allow_hyphen_values = true)]
        cutoff: i64,
    },
    /// Encode text with the safe-byte codec (path-escaped)
    Encode { text: String },
    /// Decode a path-escaped safe-byte string
    Decode { encoded: String },
    /// Encode a signed integer, or decode one with --decode
    Int {
        #[arg(allow_hyphen_values = true)]
        value: String,
        #[arg(long)]
        decode: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let connect = || BlobClient::new(&cli.server, Duration::from_secs(cli.timeout));

    match &cli.command {
        Command::Post { file, at } => {
            let blob = match file {
                Some(path) => {
                    std::fs::read(path).with_context(|| format!("reading {:?}", path))?
                }
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            let at = at.unwrap_or_else(|| chrono::Utc::now().timestamp());
            let address = connect()?.post_blob(blob.into(), at).await?;
            println!("node {}", escape_segment(&codec::encode(&address.node)));
            println!("id   {}", escape_segment(&codec::encode(&address.id)));
        }
        Command::Get { node, id, out } => {
            let address = BlobAddress {
                node: codec::decode(&unescape_segment(node)),
                id: codec::decode(&unescape_segment(id)),
            };
            let blob = connect()?.get_blob(&address).await?;
            match out {
                Some(path) => {
                    std::fs::write(path, &blob).with_context(|| format!("writing {:?}", path))?
                }
                None => std::io::stdout().write_all(&blob)?,
            }
        }
        Command::Expire { cutoff } => {
            connect()?.expire(*cutoff).await?;
            println!("expire requested before {}", cutoff);
        }
        Command::Encode { text } => {
            println!("{}", escape_segment(&codec::encode(text.as_bytes())));
        }
        Command::Decode { encoded } => {
            let raw = codec::decode(&unescape_segment(encoded));
            println!("{}", String::from_utf8_lossy(&raw));
        }
        Command::Int { value, decode } => {
            if *decode {
                println!("{}", decode_timestamp(&unescape_segment(value)));
            } else {
                let value: i64 = value.parse().context("not an integer")?;
                println!("{}", escape_segment(&encode_timestamp(value)));
            }
        }
    }

    Ok(())
}
