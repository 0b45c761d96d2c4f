//! `divid` node: configuration, store setup, startup and block import around
//! the chain-state engine.

use std::fs;
use std::sync::Arc;

use divid_chainstate::flatfiles::DEFAULT_MAX_FILE_SIZE;
use divid_chainstate::{fatal_channel, AbortSignal, ChainState, Collaborators, FlatFileBlockStore};
use divid_consensus::consensus_params;
use divid_log::{self as logging, log_error, log_info, log_warn};

pub mod config;
pub mod import;
pub mod status;
pub mod store;

use config::{Backend, CliAction, Config};
use status::NodeStatus;
use store::{lock_data_dir, open_store, Store};

pub fn run_entry() -> Result<(), String> {
    match config::parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", config::usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("divid {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => {
            let print_status = config.status;
            let status = run_with_config(*config)?;
            if print_status {
                println!("{}", status.to_json()?);
            }
            Ok(())
        }
    }
}

fn abort_message(abort: &AbortSignal, fallback: String) -> String {
    let messages = abort.drain();
    if messages.is_empty() {
        fallback
    } else {
        format!("aborting: {}", messages.join("; "))
    }
}

/// Opens the chain state, runs the configured imports and shuts down
/// cleanly. Returns the final chain-state summary.
pub fn run_with_config(config: Config) -> Result<NodeStatus, String> {
    logging::init(config.log.clone());
    fs::create_dir_all(&config.data_dir)
        .map_err(|err| format!("failed to create {}: {err}", config.data_dir.display()))?;
    let _lock = lock_data_dir(&config.data_dir)?;
    log_info!(
        "divid {} on {} (data dir {})",
        env!("CARGO_PKG_VERSION"),
        config.network.as_str(),
        config.data_dir.display()
    );
    if config.backend == Backend::Memory {
        log_warn!("memory backend selected; chain state is discarded on exit");
    }

    let params = consensus_params(config.network);
    let store: Store = open_store(config.backend, &config.data_dir.join("db"))?;
    let blocks_dir = config.data_dir.join("blocks");
    fs::create_dir_all(&blocks_dir)
        .map_err(|err| format!("failed to create {}: {err}", blocks_dir.display()))?;
    let blocks = FlatFileBlockStore::open(&blocks_dir, DEFAULT_MAX_FILE_SIZE)
        .map_err(|err| format!("failed to open block files: {err}"))?;

    let (sink, abort) = fatal_channel();
    let collaborators = Collaborators::standard(&params);
    let mut state = ChainState::new(
        params,
        store,
        Arc::new(blocks),
        config.chainstate,
        collaborators,
        sink,
    )
    .map_err(|err| format!("failed to create chain state: {err}"))?;
    state
        .load_block_index(&config.startup)
        .map_err(|err| abort_message(&abort, format!("failed to load block index: {err}")))?;

    for path in &config.imports {
        match import::import_blocks(&mut state, path, &abort) {
            Ok(_) => {}
            // The shutdown flag stays unset so the next start reconciles.
            Err(err) if abort.is_raised() => return Err(abort_message(&abort, err)),
            Err(err) => log_error!("{err}"),
        }
    }
    if abort.is_raised() {
        return Err(abort_message(&abort, "aborting".to_string()));
    }

    let status = NodeStatus::collect(&state);
    state
        .shutdown()
        .map_err(|err| abort_message(&abort, format!("shutdown failed: {err}")))?;
    Ok(status)
}
