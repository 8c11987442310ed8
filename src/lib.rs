//! Warden: an in-process plugin kernel.
//!
//! Independently authored modules communicate only through a mediated,
//! policy-enforced event bus. The kernel owns permissions, schema contracts,
//! the module lifecycle and per-module resource reclamation, and a watchdog
//! that contains misbehaving modules without ever containing itself.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod kernel;

pub mod bridge;
pub mod host;

pub mod modules;
