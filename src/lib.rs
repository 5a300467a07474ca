//! Local coordination service for spatial panner plugins.
//!
//! Discovers running panner instances through their shared-memory segments,
//! drains their audio and parameters into a unified tracker and spatial bus,
//! relays control traffic between plugins, monitors, and players over a
//! localhost OSC plane, and supervises the external orientation manager.
//!
//! The shared-memory protocol itself lives in the `m1-memshare` crate; this
//! crate is the service built on top of it.

pub mod error;
pub use error::{HelperError, Result};

pub mod config;
pub use config::HelperConfig;

pub mod paths;
pub mod process;

pub mod events;
pub use events::{EventBus, HelperEvent};

pub mod clients;
pub use clients::{ClientKind, ClientRecord, ClientRegistry};

pub mod plugins;
pub use plugins::{PluginRecord, PluginRegistry};

pub mod tracker;
pub use tracker::{PannerKey, PannerRecord, PannerStatus, PannerTracker};

pub mod discovery;
pub use discovery::{ScannerConfig, SegmentScanner};

pub mod mixer;
pub use mixer::SpatialMixer;

pub mod osc;
pub use osc::OscDispatcher;

pub mod supervisor;
pub use supervisor::{ServiceCommands, Supervisor};

pub mod service;
pub use service::HelperService;
