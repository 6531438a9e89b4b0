//! pagecraft-seed
//!
//! Opens the configured workspace storage, seeding the default app and its
//! home page on first run, and prints what the workspace contains.
//!
//! Usage: `pagecraft-seed [config.json]`. `PAGECRAFT_*` variables override
//! the file; `RUST_LOG` overrides the configured log filter.

use pagecraft::infrastructure::BuilderConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => BuilderConfig::load(path)?,
        None => BuilderConfig::default(),
    }
    .with_env()?;

    init_tracing(&config.log_filter)?;
    info!(
        storage = %config.storage_dir.display(),
        prefix = %config.key_prefix,
        "opening workspace"
    );

    let store = pagecraft::open_workspace(&config)?;
    let workspace = store.snapshot();
    println!("workspace version {}", workspace.version);
    for app in store.apps() {
        println!("{} ({})", app.name, app.id);
        for page_id in &app.pages {
            let page = store.page(page_id)?;
            println!("  page {} {} [{} components]", page.path, page.name, page.components.len());
        }
        for table_id in &app.tables {
            let table = store.table(table_id)?;
            println!(
                "  table {} [{} fields, {} records]",
                table.name,
                table.fields.len(),
                table.records.len()
            );
        }
    }
    Ok(())
}

fn init_tracing(fallback: &str) -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| error.to_string())
}
