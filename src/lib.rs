//! deskpack - runtime provisioning and build orchestration for packaged
//! desktop web/PHP applications.
//!
//! The library fetches and verifies interpreter releases, mirrors runtime
//! trees into ephemeral or persistent roots, supervises a local dev server
//! whose port is chosen by the OS, and drives the external packaging
//! toolchain. Directory clearing throughout goes through [`fsops::FsMutator`],
//! which tolerates files locked by other processes.

pub mod build;
pub mod config;
pub mod events;
pub mod fsops;
pub mod logging;
pub mod processes;
pub mod provision;
pub mod runtime;
pub mod server;
