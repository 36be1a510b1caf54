//! Scan progress convergence.
//!
//! # Data Flow
//! ```text
//! ProgressSource (pull)     PushFeed (push, wake only)
//!   scans.status              snapshot row changes
//!   scan_events               scan_progress:{id} broadcast
//!   findings count                  │
//!   scan_progress row               │
//!        │                          ▼
//!        └──── reconcile::fetch_progress ←── tracker wake channel ←── poller / heartbeat
//!                     │
//!                     ▼
//!               TrackerView (watch)
//! ```
//!
//! # Design Decisions
//! - Push payloads are never trusted; every wake re-reads all four signals
//! - A terminal status freezes the view for that scan
//! - Polling runs alongside push, and a heartbeat restarts it if push goes quiet

pub mod memory;
pub mod pointer;
pub mod realtime;
pub mod reconcile;
pub mod rest;
pub mod signals;
pub mod source;
pub mod tracker;

pub use memory::MemorySignals;
pub use pointer::{FilePointerStore, MemoryPointerStore, PointerError, PointerStore};
pub use realtime::RealtimeFeed;
pub use rest::RestSignals;
pub use signals::{
    ClientScanPointer, ConnectionStatus, ProviderStage, ProviderStageEvent, PushMessage,
    ScanProgress, ScanProgressSnapshot, ScanStatus, SignalError,
};
pub use source::{ProgressSource, PushFeed, PushStream};
pub use tracker::{ScanTracker, SessionHandle, TrackerView};
