//! Chain state: block index, coins, undo data, side indexes and the
//! connect/disconnect engine.

pub mod address_index;
pub mod blockindex;
pub mod blockstore;
pub mod blocktree;
pub mod chain;
pub mod coins;
pub mod coinsdb;
pub mod connect;
pub mod difficulty;
pub mod fatal;
pub mod filemeta;
pub mod flatfiles;
pub mod incentives;
pub mod index_updates;
pub mod metrics;
pub mod peers;
pub mod reconcile;
pub mod spentindex;
pub mod state;
pub mod txindex;
pub mod undo;
pub mod validation;
pub mod versionbits;

pub use blockstore::{BlockDataReader, BlockDataStore, FlatFileBlockStore};
pub use connect::{ActiveRules, IndexingFlags};
pub use fatal::{fatal_channel, AbortSignal, FatalErrorSink};
pub use reconcile::StartupOptions;
pub use state::{
    ChainState, ChainStateError, ChainStateOptions, ChainTip, Collaborators, SharedChainState,
};
pub use validation::ValidationError;
