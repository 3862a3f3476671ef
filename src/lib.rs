//! # objdisk - Log-Structured Object-Backed Virtual Disk
//!
//! objdisk is a userspace block device that stores a virtual disk as a
//! sequence of immutable numbered objects on an object backend, fronted by
//! a two-tier cache on a local SSD:
//!
//! - a **write cache**: a circular journal that makes writes durable before
//!   they reach the backend, with group commit and crash replay
//! - a **read cache**: fixed 64 KiB chunk slots keyed by (object, chunk),
//!   with per-chunk page-validity masks and random eviction
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │            Volume (container)        │
//! ├──────────────┬───────────────────────┤
//! │ Write cache  │      Read cache       │
//! │ (journal on  │  (chunk slots on SSD) │
//! │  SSD ring)   │                       │
//! ├──────────────┴───────────────────────┤
//! │   Translation layer (batching, maps, │
//! │    checkpoints, writer pool)         │
//! ├──────────────────────────────────────┤
//! │   Object backend (file-per-object)   │
//! └──────────────────────────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! Write: client → journal append (durable, acknowledged) → forwarded to
//! the translation layer → batched into a DATA object → backend → object
//! map updated → journal region eventually reclaimed.
//!
//! Read: client → write-cache forward map (newest data) → read cache
//! (chunk hit/miss against the object map) → backend fetch on miss →
//! admitted for next time. Unwritten ranges read as zeros.
//!
//! ## Durability
//!
//! A write is durable when its completion fires: the journal record is on
//! the SSD, the forward map reflects it, and a copy is on its way to the
//! translation layer. Crash recovery replays journal records strictly
//! newer than the last checkpoint and rolls the object sequence forward
//! past the last translation checkpoint.
//!
//! ## Quick Start
//!
//! ```ignore
//! use objdisk::{Config, Volume};
//!
//! let cfg = Config::from_env()?;
//! Volume::create(&cfg, "/data/objects".as_ref(), "vol0", 1 << 30)?;
//! let vol = Volume::open(&cfg, "/data/objects".as_ref(), "vol0")?;
//!
//! vol.write(0, &buf)?;          // durable on return
//! vol.read(0, &mut out)?;
//! vol.flush();
//! ```
//!
//! ## Module Overview
//!
//! - [`volume`]: the container wiring all layers together
//! - [`translate`]: batching, object map, checkpoints, recovery
//! - [`wcache`]: SSD journal, group commit, eviction, replay
//! - [`rcache`]: chunk slots, validity masks, random eviction
//! - [`extmap`]: the interval map behind all three address translations
//! - [`ondisk`]: every persistent structure, zerocopy little-endian
//! - [`backend`] / [`cachedev`]: object store and SSD capability traits

pub mod backend;
pub mod cachedev;
pub mod config;
pub mod error;
pub mod extmap;
pub mod ondisk;
pub mod rcache;
pub mod request;
pub mod translate;
pub mod volume;
pub mod wcache;

pub use backend::{FileBackend, ObjectBackend, ObjectId};
pub use config::{BackendKind, Config};
pub use error::EngineError;
pub use extmap::{Extent, ExtentMap, ExtentValue, LbaPtr, ObjOffset, SectorPtr};
pub use rcache::ReadCache;
pub use request::Completion;
pub use translate::{ObjMap, Translate};
pub use volume::Volume;
pub use wcache::WriteCache;
