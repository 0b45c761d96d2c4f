//! Bulk block import from length-prefixed block files.
//!
//! The format matches the `blk?????.dat` flat files: each record is a 4-byte
//! little-endian length followed by one serialized block. A reader thread
//! decodes records ahead of the connect loop.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::bounded;
use divid_chainstate::{AbortSignal, ChainState, ChainStateError};
use divid_consensus::constants::MAX_BLOCK_SIZE;
use divid_log::{log_debug, log_info, log_warn};
use divid_primitives::block::Block;
use divid_primitives::encoding::decode;
use divid_storage::KeyValueStore;

const IMPORT_QUEUE: usize = 64;
const PROGRESS_EVERY: u64 = 10_000;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ImportSummary {
    pub read: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub orphans: u64,
}

enum ImportEvent {
    Block(Box<Block>),
    Failed(String),
}

fn read_record(reader: &mut impl Read, path: &Path) -> Result<Option<Vec<u8>>, String> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    }
    let len = u32::from_le_bytes(len);
    if len == 0 || len > MAX_BLOCK_SIZE {
        return Err(format!("bad record length {len} in {}", path.display()));
    }
    let mut bytes = vec![0u8; len as usize];
    reader
        .read_exact(&mut bytes)
        .map_err(|err| format!("truncated record in {}: {err}", path.display()))?;
    Ok(Some(bytes))
}

fn spawn_reader(
    path: PathBuf,
) -> Result<(crossbeam_channel::Receiver<ImportEvent>, thread::JoinHandle<()>), String> {
    let file =
        File::open(&path).map_err(|err| format!("failed to open {}: {err}", path.display()))?;
    let (tx, rx) = bounded(IMPORT_QUEUE);
    let handle = thread::Builder::new()
        .name("loadblk".to_string())
        .spawn(move || {
            let mut reader = BufReader::new(file);
            loop {
                let event = match read_record(&mut reader, &path) {
                    Ok(None) => return,
                    Ok(Some(bytes)) => match decode::<Block>(&bytes) {
                        Ok(block) => ImportEvent::Block(Box::new(block)),
                        Err(err) => {
                            ImportEvent::Failed(format!("undecodable block in {}: {err}", path.display()))
                        }
                    },
                    Err(err) => ImportEvent::Failed(err),
                };
                let stop = matches!(event, ImportEvent::Failed(_));
                if tx.send(event).is_err() || stop {
                    return;
                }
            }
        })
        .map_err(|err| format!("failed to spawn block reader: {err}"))?;
    Ok((rx, handle))
}

/// Feeds every block in `path` to the engine. Consensus rejections and
/// orphans are counted and skipped; fatal engine errors stop the import.
pub fn import_blocks<S: KeyValueStore + Clone>(
    state: &mut ChainState<S>,
    path: &Path,
    abort: &AbortSignal,
) -> Result<ImportSummary, String> {
    log_info!("Importing blocks from {}", path.display());
    let (rx, handle) = spawn_reader(path.to_path_buf())?;
    let mut summary = ImportSummary::default();
    let mut failure = None;

    for event in rx.iter() {
        if abort.is_raised() {
            break;
        }
        let block = match event {
            ImportEvent::Block(block) => block,
            ImportEvent::Failed(err) => {
                failure = Some(err);
                break;
            }
        };
        summary.read += 1;
        match state.accept_block(&block, None) {
            Ok(()) => summary.accepted += 1,
            Err(ChainStateError::OrphanHeader(prev)) => {
                summary.orphans += 1;
                log_debug!(
                    "Skipping orphan block {} (missing parent {})",
                    divid_consensus::hash256_to_hex(&block.hash()),
                    divid_consensus::hash256_to_hex(&prev)
                );
            }
            Err(err) if err.is_fatal() => {
                failure = Some(format!("import stopped: {err}"));
                break;
            }
            Err(err) => {
                summary.rejected += 1;
                log_warn!(
                    "Rejected imported block {}: {err}",
                    divid_consensus::hash256_to_hex(&block.hash())
                );
            }
        }
        if summary.read % PROGRESS_EVERY == 0 {
            log_info!("Imported {} blocks, height {}", summary.read, state.height());
        }
    }
    drop(rx);
    let _ = handle.join();

    if let Some(err) = failure {
        return Err(err);
    }
    log_info!(
        "Import of {} done: {} read, {} accepted, {} rejected, {} orphans; height {}",
        path.display(),
        summary.read,
        summary.accepted,
        summary.rejected,
        summary.orphans,
        state.height()
    );
    Ok(summary)
}
