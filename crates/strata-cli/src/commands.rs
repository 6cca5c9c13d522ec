use std::fs;
use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use colored::Colorize;
use strata_store::{open_store, BlobStore, GarbageCollector, InMemoryBlobStore, StoreConfig};
use strata_txn::{Transaction, TransactionStatus, TransactionalBlobStore};
use strata_types::{BlobContext, BlobUpdateContext, ByteRange, OptionalOrUnknown};
use tracing::debug;

use crate::cli::*;

const SECRET_PROPERTIES: &[&str] = &["aes.password"];

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = StoreConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Command::Config(args) = &cli.command {
        return cmd_config(&config, args);
    }
    let name = config.get_string("name", "default");
    let store = open_store(&name, &config)?;
    debug!(store = %name, strategy = %store.key_strategy(), "opened store");
    match cli.command {
        Command::Put(args) => cmd_put(store.as_ref(), args),
        Command::Import(args) => cmd_import(store, args),
        Command::Get(args) => cmd_get(store.as_ref(), args),
        Command::Cat(args) => cmd_cat(store.as_ref(), args),
        Command::Delete(args) => cmd_delete(store.as_ref(), args),
        Command::List(args) => cmd_list(store.as_ref(), args),
        Command::Props(args) => cmd_props(store.as_ref(), args),
        Command::Hold(args) => cmd_hold(store.as_ref(), args),
        Command::Retain(args) => cmd_retain(store.as_ref(), args),
        Command::Gc(args) => cmd_gc(store.as_ref(), args),
        Command::Config(_) => unreachable!("handled before the store is opened"),
    }
}

fn file_blob(path: &std::path::Path) -> BlobContext {
    let blob = BlobContext::new(path.to_path_buf());
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => blob.with_filename(name),
        None => blob,
    }
}

fn cmd_put(store: &dyn BlobStore, args: PutArgs) -> anyhow::Result<()> {
    if args.files.is_empty() {
        bail!("no files given");
    }
    for path in &args.files {
        let mut blob = file_blob(path);
        if let Some(doc_id) = &args.doc_id {
            blob = blob.with_document(args.repository.clone(), doc_id.clone());
        }
        let key = store.write(&blob).with_context(|| format!("storing {}", path.display()))?;
        println!("{}  {}", key.yellow(), path.display());
    }
    Ok(())
}

fn cmd_import(store: Arc<dyn BlobStore>, args: ImportArgs) -> anyhow::Result<()> {
    let txn = if store.has_versioning() {
        TransactionalBlobStore::versioned(store)?
    } else {
        let staging = Arc::new(InMemoryBlobStore::new("staging", store.key_strategy().clone()));
        TransactionalBlobStore::with_staging(store, staging)?
    };
    let tx = Transaction::begin();
    let view = txn.bind(&tx);
    let mut stored = Vec::with_capacity(args.files.len());
    for path in &args.files {
        match view.write(&file_blob(path)) {
            Ok(key) => stored.push((key, path)),
            Err(e) => {
                tx.rollback();
                return Err(anyhow::Error::new(e).context(format!("importing {}, nothing stored", path.display())));
            }
        }
    }
    match tx.commit() {
        TransactionStatus::Committed => {
            for (key, path) in &stored {
                println!("{}  {}", key.yellow(), path.display());
            }
            println!("{} Imported {} blobs.", "✓".green().bold(), stored.len());
            Ok(())
        }
        status => bail!("import ended as {status:?}"),
    }
}

fn cmd_get(store: &dyn BlobStore, args: GetArgs) -> anyhow::Result<()> {
    if !store.read_blob(&args.key, &args.dest)? {
        bail!("blob {} not found", args.key);
    }
    println!("{} {} -> {}", "✓".green(), args.key.yellow(), args.dest.display());
    Ok(())
}

fn cmd_cat(store: &dyn BlobStore, args: CatArgs) -> anyhow::Result<()> {
    let stream = match &args.range {
        Some(range) => store.get_stream_range(&args.key, ByteRange::parse(range)?)?,
        None => store.get_stream(&args.key)?,
    };
    let mut stream = match stream {
        OptionalOrUnknown::Present(stream) => stream,
        OptionalOrUnknown::Missing => bail!("blob {} not found", args.key),
        OptionalOrUnknown::Unknown => bail!("store {} cannot stream blob {}", store.name(), args.key),
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();
    io::copy(&mut stream, &mut out)?;
    out.flush()?;
    Ok(())
}

fn cmd_delete(store: &dyn BlobStore, args: DeleteArgs) -> anyhow::Result<()> {
    for key in &args.keys {
        store.delete_blob(key).with_context(|| format!("deleting {key}"))?;
        println!("Deleted {}", key.yellow());
    }
    Ok(())
}

fn cmd_list(store: &dyn BlobStore, args: ListArgs) -> anyhow::Result<()> {
    let blobs = store.list_blobs()?;
    for blob in &blobs {
        if args.quiet {
            println!("{}", blob.key);
            continue;
        }
        let mut flags = Vec::new();
        if blob.properties.legal_hold {
            flags.push("hold".red().to_string());
        }
        if let Some(until) = blob.properties.retain_until {
            flags.push(format!("retained until {}", until.to_rfc3339()).cyan().to_string());
        }
        println!("{}  {:>12}  {}", blob.key.yellow(), blob.length, flags.join(", "));
    }
    if !args.quiet {
        println!("{} blobs", blobs.len().to_string().bold());
    }
    Ok(())
}

fn cmd_props(store: &dyn BlobStore, args: PropsArgs) -> anyhow::Result<()> {
    let props = store.blob_properties(&args.key)?;
    println!("Blob {}", args.key.yellow().bold());
    println!("  Legal hold: {}", if props.legal_hold { "yes".red() } else { "no".green() });
    match props.retain_until {
        Some(until) => println!("  Retain until: {}", until.to_rfc3339().cyan()),
        None => println!("  Retain until: {}", "-".dimmed()),
    }
    Ok(())
}

fn cmd_hold(store: &dyn BlobStore, args: HoldArgs) -> anyhow::Result<()> {
    store.write_blob_properties(&BlobUpdateContext::new(&args.key).with_legal_hold(!args.release))?;
    let action = if args.release { "Released hold on" } else { "Placed hold on" };
    println!("{} {} {}", "✓".green(), action, args.key.yellow());
    Ok(())
}

fn cmd_retain(store: &dyn BlobStore, args: RetainArgs) -> anyhow::Result<()> {
    let until = match &args.until {
        Some(text) => Some(
            DateTime::parse_from_rfc3339(text)
                .with_context(|| format!("invalid deadline {text:?}"))?
                .with_timezone(&Utc),
        ),
        None => None,
    };
    store.write_blob_properties(&BlobUpdateContext::new(&args.key).with_retain_until(until))?;
    match until {
        Some(until) => println!("{} {} retained until {}", "✓".green(), args.key.yellow(), until.to_rfc3339()),
        None => println!("{} Cleared retention on {}", "✓".green(), args.key.yellow()),
    }
    Ok(())
}

fn cmd_gc(store: &dyn BlobStore, args: GcArgs) -> anyhow::Result<()> {
    let mut gc = GarbageCollector::new(store);
    gc.start()?;
    for key in &args.keep {
        gc.mark(key.clone());
    }
    if let Some(path) = &args.keep_file {
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        for key in text.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#')) {
            gc.mark(key);
        }
    }
    let status = gc.remove_unmarked_blobs_and_update_status(args.delete)?;
    let verb = if args.delete { "removed" } else { "removable" };
    println!(
        "{} GC: kept {} blobs ({} bytes), {} {} blobs ({} bytes)",
        "✓".green(),
        status.num_binaries,
        status.size_binaries,
        verb,
        status.num_binaries_gc.to_string().bold(),
        status.size_binaries_gc,
    );
    Ok(())
}

fn cmd_config(config: &StoreConfig, args: &ConfigArgs) -> anyhow::Result<()> {
    let shown = |name: &str, value: &str| {
        if SECRET_PROPERTIES.contains(&name) {
            "********".to_string()
        } else {
            value.to_string()
        }
    };
    match &args.name {
        Some(name) => match config.get(name) {
            Some(value) => println!("{} = {}", name.bold(), shown(name, value)),
            None => println!("{} = {}", name.bold(), "(not set)".dimmed()),
        },
        None => {
            for (name, value) in config.properties() {
                println!("{} = {}", name.bold(), shown(name, value));
            }
        }
    }
    Ok(())
}
