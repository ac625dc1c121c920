//! Bluetooth Module
//!
//! Provides BLE discovery and command exchange with Anki Drive vehicles.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    VehicleService                        │
//! │  (Main coordinator - public API for the console)         │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┬──────────────┐
//!         │             │              │              │
//!         ▼             ▼              ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Dispatcher │  │ Protocol │
//! │           │  │            │  │            │  │          │
//! │ - adverts │  │ - pairing  │  │ - decode   │  │ - frames │
//! │ - registry│  │ - retry    │  │ - observers│  │ - codes  │
//! └─────┬─────┘  └─────┬──────┘  └────────────┘  └──────────┘
//!       │              │
//!       ▼              ▼
//! ┌─────────────────────────────┐
//! │ Transport (WinRT or mock)   │
//! └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Message framing, command codes and response decoding
//! - [`advertisement`] - Advertisement payload parsing
//! - [`scanner`] - Feeds advertisements into the vehicle registry
//! - [`transport`] - Platform seam for pairing and GATT access
//! - [`connection`] - Pairing lifecycle, connect retry and command writes
//! - [`dispatcher`] - Routes notification frames to observers
//! - [`service`] - Main service coordinator

pub mod advertisement;
pub mod connection;
pub mod dispatcher;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

pub use service::VehicleService;
