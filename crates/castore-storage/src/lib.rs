#![warn(missing_docs)]

//! castore storage subsystem: content-addressed volumes with transactional indexes
//!
//! A volume owns one root directory and one embedded redb database. Content is
//! stored once per SHA-1 signature under a sharded path; user keys, expiry
//! buckets, peer holders and replica queues are indexed in the database. Every
//! operation runs in a unit of work that commits or rolls back the database
//! transaction and the filesystem changes together.

pub mod background;
pub mod bucket;
pub mod error;
pub mod fs;
pub mod index;
pub mod keygen;
pub mod layout;
pub mod model;
pub mod queue;
pub mod state;
pub mod stream;
pub mod tracker;
pub mod uow;
pub mod volume;

pub use background::{is_shutting_down, spawn_volume_loops};
pub use error::{StoreError, StoreResult};
pub use fs::{Fs, OsFs};
pub use keygen::KeyGenerator;
pub use layout::{signature_path, VolumeLayout};
pub use model::{File, IdxKey, IdxTtl, IdxVolume, Replica, ReplicaPendent, ReplicaRetry, State};
pub use stream::{bytes_stream, collect_bytes, reader_stream, signature_of, stream_reader, ByteStream, CreateOptions};
pub use tracker::{FsAction, FsTracker};
pub use uow::{Resource, Scope, UnitOfWork, UowKind};
pub use volume::{IndexSnapshot, LocalVolume, VolumeConfig, VolumeContext, MAX_RETRY_ATTEMPTS};
