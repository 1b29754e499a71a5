//! Farm-wide cache synchronisation.
//!
//! Every node keeps its own in-process caches. Writers publish [`RefresherCommand`]s
//! into a shared, append-only instruction log in the same transaction as the data they
//! change; each node's [`SyncWorker`] replays the log into its [`RefresherRegistry`] and
//! records how far it got in a per-node checkpoint.
//!
//! - [`Publisher`]: appends instructions inside a caller's transaction
//! - [`SyncWorker`]: replays, with cold start, gap detection and backoff
//! - [`PruneWorker`]: retention housekeeping, run by the pruning owner only
//!
//! Delivery is at least once; refreshers must be idempotent.
//!
//! [`RefresherCommand`]: farmsync_types::RefresherCommand

mod config;
mod error;
mod keyed;
mod lock;
mod ownership;
mod prune;
mod publisher;
mod refresher;
mod registry;
mod worker;

pub use config::{PruneConfig, SyncConfig};
pub use error::{ColdStartReason, PublishError, SyncError};
pub use keyed::{KeyedCache, KeyedCacheRefresher, Lookup, SnapshotSource};
pub use ownership::{OwnershipFn, PruneOwnership};
pub use prune::PruneWorker;
pub use publisher::{PublishReceipt, Publisher};
pub use refresher::{Refresher, RefresherError};
pub use registry::{Applied, RefresherRegistry};
pub use worker::{SyncPhase, SyncWorker, TickOutcome, WorkerStatus};

pub(crate) use lock::mutex_lock;
