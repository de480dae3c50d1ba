//! Screen-state observation core for mobile-device automation.
//!
//! One `observe` call composes the device probes — geometry, insets,
//! rotation, active window, screenshot, view hierarchy — into a single
//! best-effort [`models::Observation`]. A separate stability detector reads
//! per-app rendering statistics so callers can wait for the UI to settle
//! before acting.

pub mod accessibility;
pub mod adb;
pub mod cache;
pub mod config;
pub mod dumpsys;
pub mod error;
pub mod hierarchy;
pub mod logging;
pub mod models;
pub mod observer;
pub mod screenshot;
pub mod stability;
pub mod window;

pub use adb::{AdbExecutor, DeviceExecutor, IdbExecutor};
pub use cache::CacheService;
pub use config::ObserverConfig;
pub use error::AppError;
pub use models::{DeviceTarget, Observation, Platform};
pub use observer::Observer;
pub use stability::StabilityDetector;
