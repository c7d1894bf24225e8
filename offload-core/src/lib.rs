//! Core engine of Offload, a removable-media ingestion service.
//!
//! The engine watches for volumes through an injected [`device::VolumeProbe`],
//! recalls previously seen devices as ghosts, walks and then live-watches each
//! mounted root through a configurable filter chain, deduplicates content by
//! SHA-256 fingerprint, and copies unique files into a local work area under
//! load-adaptive admission control. A storage recycler keeps the work area
//! inside its configured budget.
//!
//! Components communicate over the typed in-process [`events::EventBus`] and
//! share the [`fingerprint::FingerprintIndex`]; long-running pieces implement
//! [`service::Service`] and run on their own interval tasks.
//!
//! The graphical surface, localization, and platform volume-serial query live
//! with the host application; this crate only depends on their contracts.

pub mod clock;
pub mod device;
pub mod discover;
pub mod error;
pub mod events;
pub mod filter;
pub mod fingerprint;
pub mod recycle;
pub mod schedule;
pub mod service;
pub mod stats;

pub use clock::{Clock, SystemClock};
pub use device::{DeviceManager, DeviceSerial, DeviceSnapshot, DeviceState};
pub use error::{OffloadError, Result};
pub use events::EventBus;
pub use fingerprint::{Fingerprint, FingerprintIndex, IndexPersistence, IndexStore};
pub use recycle::{Recycler, StorageLevel};
pub use schedule::{CopyResult, CopyTask, TaskScheduler, TaskSink};
pub use service::{Service, ServiceRunner, ServiceState};
pub use stats::{CopyStatistics, StatsSnapshot};
