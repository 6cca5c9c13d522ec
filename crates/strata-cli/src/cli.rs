use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "strata", about = "Strata - transactional content-addressable blob store", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Store configuration (TOML)
    #[arg(short, long, global = true, default_value = "strata.toml")]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Store files and print their keys
    Put(PutArgs),
    /// Store several files in one transaction: all or nothing
    Import(ImportArgs),
    /// Write a blob to a file
    Get(GetArgs),
    /// Write a blob (or a byte range of it) to stdout
    Cat(CatArgs),
    /// Delete blobs
    Delete(DeleteArgs),
    /// List stored blobs
    List(ListArgs),
    /// Show the retention properties of a blob
    Props(PropsArgs),
    /// Place or release a legal hold
    Hold(HoldArgs),
    /// Set or clear a retention deadline
    Retain(RetainArgs),
    /// Delete blobs that are not referenced
    Gc(GcArgs),
    /// Show the effective store configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct PutArgs {
    pub files: Vec<PathBuf>,
    /// Owning document id, required by the doc-id key strategy
    #[arg(long)]
    pub doc_id: Option<String>,
    #[arg(long, default_value = "default")]
    pub repository: String,
}

#[derive(Args)]
pub struct ImportArgs {
    pub files: Vec<PathBuf>,
}

#[derive(Args)]
pub struct GetArgs {
    pub key: String,
    pub dest: PathBuf,
}

#[derive(Args)]
pub struct CatArgs {
    pub key: String,
    /// Inclusive byte range, e.g. `bytes=0-99`
    #[arg(long)]
    pub range: Option<String>,
}

#[derive(Args)]
pub struct DeleteArgs {
    pub keys: Vec<String>,
}

#[derive(Args)]
pub struct ListArgs {
    /// Print keys only
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct PropsArgs {
    pub key: String,
}

#[derive(Args)]
pub struct HoldArgs {
    pub key: String,
    /// Release the hold instead of placing it
    #[arg(long)]
    pub release: bool,
}

#[derive(Args)]
pub struct RetainArgs {
    pub key: String,
    /// RFC 3339 deadline; omit to clear
    #[arg(long)]
    pub until: Option<String>,
}

#[derive(Args)]
pub struct GcArgs {
    /// Keys still referenced
    pub keep: Vec<String>,
    /// File with one referenced key per line
    #[arg(long)]
    pub keep_file: Option<PathBuf>,
    /// Actually delete; without it only counts are reported
    #[arg(long)]
    pub delete: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Show a single property
    pub name: Option<String>,
}
