//! Command-line client for the secure search server
//!
//! Exit codes: 0 success, 2 authentication failure, 3 network failure,
//! 4 server-side error.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::Value;

use secure_search::client::{exit_code_for, ClientPipeline, ENV_API_KEY, ENV_SERVER_URL};
use secure_search::types::LshSettings;
use secure_search::Error;

#[derive(Parser)]
#[command(
    name = "secure-search",
    about = "Encrypted similarity search client",
    version
)]
struct Cli {
    /// Server base URL (falls back to SECURE_SEARCH_SERVER_URL)
    #[arg(long, env = ENV_SERVER_URL)]
    server_url: String,

    /// Bearer token (falls back to SECURE_SEARCH_API_KEY)
    #[arg(long, env = ENV_API_KEY, hide_env_values = true)]
    api_key: String,

    /// Embedding dimension
    #[arg(long, default_value_t = 384)]
    dim: u32,

    /// Strip plaintext `text` fields from uploaded metadata
    #[arg(long)]
    strip_plaintext_metadata: bool,

    /// LSH tables (must match the shape the client was initialized with)
    #[arg(long, default_value_t = 20)]
    num_tables: u32,

    /// Bits per LSH hash
    #[arg(long, default_value_t = 16)]
    hash_size: u32,

    /// Candidate pool ceiling
    #[arg(long, default_value_t = 100)]
    num_candidates: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the client and print the assigned client_id
    Init,
    /// Upload one text as an encrypted embedding
    Add {
        text: String,
        /// JSON object with extra metadata
        #[arg(long)]
        metadata: Option<String>,
        #[arg(long)]
        external_id: Option<String>,
    },
    /// Search for similar texts and print decrypted scores
    Search {
        query: String,
        #[arg(long, default_value_t = 5)]
        top_k: u32,
        #[arg(long, default_value_t = 50)]
        rerank: u32,
    },
    /// Print usage counters for this client
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::from(exit_code_for(&err) as u8)
        }
    }
}

async fn run() -> Result<(), Error> {
    let cli = Cli::parse();

    let mut pipeline = ClientPipeline::new(&cli.server_url, &cli.api_key, cli.dim)
        .with_strip_plaintext(cli.strip_plaintext_metadata);

    let lsh = LshSettings {
        num_tables: cli.num_tables,
        hash_size: cli.hash_size,
        num_candidates: cli.num_candidates,
    };

    match cli.command {
        Command::Init => {
            let client_id = pipeline.initialize(lsh).await?;
            println!("{}", client_id);
        }
        Command::Add {
            text,
            metadata,
            external_id,
        } => {
            pipeline.initialize(lsh).await?;

            let metadata = metadata
                .map(|raw| serde_json::from_str::<Value>(&raw))
                .transpose()
                .map_err(|e| Error::validation(format!("invalid --metadata JSON: {}", e)))?;

            let embedding_id = pipeline
                .add_embedding(&text, metadata, external_id.as_deref())
                .await?;
            println!("{}", embedding_id);
        }
        Command::Search {
            query,
            top_k,
            rerank,
        } => {
            pipeline.initialize(lsh).await?;

            let (matches, stats) = pipeline.search(&query, top_k, rerank).await?;
            for (rank, result) in matches.iter().enumerate() {
                let label = result
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or("<no text>");
                println!(
                    "{:2}. {:.4}  {}  {}",
                    rank + 1,
                    result.similarity,
                    result.embedding_id,
                    label
                );
            }
            eprintln!(
                "checked {} of {} candidates in {} ms",
                stats.candidates_checked, stats.candidates_found, stats.total_time_ms
            );
        }
        Command::Stats => {
            pipeline.initialize(lsh).await?;
            let stats = pipeline.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
