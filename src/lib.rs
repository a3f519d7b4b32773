//! # Shardsync
//!
//! Resumable, bandwidth-economical replication of large shard-structured
//! datasets through a commodity object store.
//!
//! Shardsync compares a source and a destination *profile* — JSON documents
//! enumerating a dataset's shard files with sizes and sampled digests —
//! computes the minimum set of byte windows that must flow, exposes those
//! windows through an offset-view FUSE mount for upload, and stitches the
//! downloaded windows into place on the destination with digest-verified
//! moves and appends. A small relational store records per-file progress so
//! interrupted runs resume where they left off.
//!
//! ## Pipeline
//!
//! ```text
//! profiles ──► planner ──► {SyncTask}
//!                            │
//!        sender: offset-view mount ──► object store ──► receiver cache
//!                                                          │
//!                                            reconciler ──► final placement
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use shardsync::planner::{plan, PlanOptions};
//! use shardsync::profile::Profile;
//!
//! let src = Profile::load("source.profile.json".as_ref())?;
//! let dst = Profile::load("dest.profile.json".as_ref())?;
//! let tasks = plan(&dst, &src, &PlanOptions::default())?;
//! for task in tasks.values() {
//!     println!("{} {}+{}", task.virtual_name, task.offset, task.size);
//! }
//! # Ok::<(), shardsync::SyncError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bucket;
pub mod digest;
mod error;
pub mod offsetfs;
pub mod planner;
pub mod profile;
pub mod receiver;
pub mod reconcile;
pub mod sender;
pub mod store;

pub use bucket::{DirBucket, ObjectInfo, ObjectStore};
pub use digest::{sampled_digest, SampledDigest};
pub use error::{Result, SyncError};
pub use offsetfs::{OffsetFs, Window, WindowConfig};
pub use planner::{plan, HostRemap, PlanOptions, RemapRule, SyncTask, TaskPlan};
pub use profile::{MapGroup, ObjectGroup, Profile, ProfileFile};
pub use receiver::{default_subdir_router, run_recv, ReceiverOptions, SubdirRouter};
pub use reconcile::{move_file, CopyMode};
pub use sender::{run_send, SenderOptions};
pub use store::{
    MemoryTaskStore, SqliteTaskStore, StatusSummary, TaskRecord, TaskStatus, TaskStore,
};
