//! graphsync - mirror a slice of a server record graph onto a client graph
//!
//! Encode side: [`ServerDataCache`] walks vectors (paths of steps from a root
//! model) against a [`RecordStore`], checks every access against an
//! [`AccessPolicy`] and folds the requested values into one [`MergedTree`].
//!
//! Decode side: [`TreeReconciler`] applies that tree to a [`MirrorGraph`].

pub mod cache;
pub mod config;
pub mod error;
pub mod policy;
pub mod reconcile;
pub mod scalar;
pub mod schema;
pub mod store;
pub mod vector;

pub use cache::{BatchStats, CacheItem, Evaluation, MergedTree, Overrides, ServerDataCache, TreeNode};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use policy::{AccessPolicy, ActingPrincipal, PermitAll, RulePolicy};
pub use reconcile::{MirrorGraph, MirrorObserver, Target, TreeReconciler};
pub use scalar::{ColumnType, Scalar};
pub use schema::Schema;
pub use store::{Datum, MemoryStore, RecordStore};
pub use vector::{Step, Vector, VectorPath, Wildcard};

use tracing_subscriber::{fmt, EnvFilter};

/// Install the stderr subscriber; `RUST_LOG` overrides the default filter
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,graphsync=info"));
    // a subscriber may already be installed (tests, embedding)
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
