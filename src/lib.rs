//! Over-the-air firmware update service for network-attached devices.
//!
//! Two subsystems do the heavy lifting: the [`connectivity`] manager keeps
//! the device reachable across station, access-point and dual radio modes
//! with bounded retry and graceful degradation, and the [`session`] pipeline
//! streams an uploaded image into the secondary storage region, verifies it
//! and atomically switches the boot target. The [`api`] module binds both to
//! an HTTP surface; [`storage`] defines the driver boundary towards the
//! platform's flash.

pub mod api;
pub mod config;
pub mod connectivity;
pub mod session;
pub mod storage;
pub mod templates;
