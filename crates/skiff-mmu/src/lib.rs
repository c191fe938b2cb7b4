#![forbid(unsafe_code)]

//! Demand paging and CPU-state handoff between a software CPU emulator and a
//! hardware accelerator running the same architectural model.
//!
//! The accelerator holds a small fixed pool of physical pages and faults to
//! the host whenever it misses a translation; the emulator holds all of
//! guest memory and the authoritative MMU. [`Dispatcher`] is the single
//! control loop tying the two together: it resolves device page faults
//! (paging guest memory in, detecting synonyms, reusing resident pages),
//! sequences faults that race with in-flight evictions, services guest
//! flushes, and transplants architectural state whenever the device gives a
//! thread back.
//!
//! The two collaborators are trait seams: [`ExecutionEngine`] is the
//! software CPU (translation, architectural state, single-stepping, and a
//! read/write capability over its backing memory), [`DeviceTransport`] is
//! the accelerator's message channel plus bulk page/state transfer. The
//! embedder owns both and lends them to the dispatcher per call.

mod config;
mod dispatch;
mod engine;
mod error;
mod flush;
mod transplant;
mod transport;

pub use crate::config::{DebugMode, SkiffConfig};
pub use crate::dispatch::Dispatcher;
pub use crate::engine::{ArchState, ExecutionEngine, TranslationMiss, XREG_COUNT};
pub use crate::error::{MmuError, Result};
pub use crate::transplant::ThreadState;
pub use crate::transport::DeviceTransport;
