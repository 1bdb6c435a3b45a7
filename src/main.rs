//! ragcag console harness.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config (path from the first argument, else `config/default.toml`)
//!   3. Init logger at the configured level
//!   4. Set up the retrieval facade and seed the built-in knowledge
//!   5. Answer one query per stdin line until EOF

use std::io::{self, BufRead, Write};

use ragcag::{AppError, ContextOptions, RagCagManager, config, logger};
use tracing::info;

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), AppError> {
    config::load_env_file(None)?;

    let config_path = std::env::args().nth(1);
    let config = config::load(config_path.as_deref())?;
    logger::init(&config.log_level, true, config.log_file.as_deref())?;

    info!(
        log_level = %config.log_level,
        vector_db = %config.rag.vector_db,
        embedding = %config.rag.embedding_service,
        collection = %config.rag.collection_name,
        "config loaded"
    );

    let mut manager = RagCagManager::new(config);
    if !manager.setup() {
        return Err(AppError::Config("retrieval setup failed (see log)".into()));
    }
    manager.seed_default_knowledge();

    let stats = manager.get_retrieval_stats();
    if let Ok(json) = serde_json::to_string(&stats) {
        info!(stats = %json, "retrieval ready");
    }
    println!(
        "✓ ragcag ready: rag={} cag={}; one query per line, Ctrl-D to quit",
        stats.rag_enabled, stats.cag_enabled
    );

    let options = ContextOptions::default();
    let mut out = io::stdout().lock();
    for line in io::stdin().lock().lines() {
        let line = line?;
        let query = line.trim();
        if query.is_empty() {
            continue;
        }

        for entity in manager.extract_entities(query) {
            writeln!(out, "[{}] {} @{}", entity.kind, entity.value, entity.position)?;
        }
        match manager.get_enhanced_context(query, &options) {
            Some(ctx) => writeln!(out, "{}\n", ctx.combined_context)?,
            None => writeln!(out, "(no context)\n")?,
        }
        out.flush()?;
    }

    manager.cleanup();
    Ok(())
}
