//! Routekeeper - control plane for a reverse proxy's generated locations
//!
//! This library manages a directory of rendered proxy location configs
//! ("backends"), each mapping a public path to an upstream service:
//! - Encodes each backend's identity in its config file name, no database
//! - Allocates backend ids and per-prefix location suffixes
//! - Retires older backends bound to the same upstream when a new one is created
//! - Re-renders backends in place to toggle access control
//! - Triggers a proxy reload after every change
//! - Serves all of it over an API key protected HTTP API

pub mod allocator;
pub mod api;
pub mod codec;
pub mod config;
pub mod duplicates;
pub mod error;
pub mod record;
pub mod registry;
pub mod reload;
pub mod service;
pub mod template;
pub mod upstream;
pub mod users;
pub mod validate;
