//! # loopbridge-core
//!
//! UI-side half of the loopbridge control bridge: the state store the UI
//! renders from, the service that feeds it engine messages, command routing
//! onto the two transports, and the composition root that ties them to a
//! frame loop.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::time::Instant;
//! use loopbridge_core::{Bridge, Config};
//! use loopbridge_types::ParameterId;
//!
//! let config = Config::load();
//! let mut bridge = Bridge::start(&config);
//!
//! // Every frame:
//! bridge.tick(Instant::now());
//!
//! // On a knob drag:
//! bridge.store().borrow_mut().set_parameter(&ParameterId::master("volume"), 0.7)?;
//! ```
//!
//! ## Module Overview
//!
//! - [`store`]: `Store`, observers, connection status
//! - [`handler`]: `MessageHandlingService`, engine message → store
//! - [`dispatch`]: `Command`, `CommandSink`, `CommandRouter` and its backings
//! - [`reconnect`]: backoff between duplex reconnect attempts
//! - [`bridge`]: `Bridge`, the per-frame driver
//! - [`config`]: TOML configuration (embedded defaults + user override)
//! - [`logging`]: file logger setup

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod handler;
pub mod logging;
pub mod reconnect;
pub mod store;

pub use bridge::Bridge;
pub use config::Config;
pub use dispatch::{Command, CommandError, CommandRouter, CommandSink, RecordingSink, TransportCommand};
pub use handler::MessageHandlingService;
pub use reconnect::Backoff;
pub use store::{Change, ConnectionStatus, Field, Store, StoreError, SubscriptionId};
