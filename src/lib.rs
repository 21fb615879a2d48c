//! Asynchronous many-task (AMT) distributed runtime core.
//!
//! A job is partitioned into worker ranks and server ranks
//! ([`layout::Layout`]). Workers call the [`client`] API to enqueue work,
//! create datums, and block on dependencies; servers run [`server::ServerContext`]'s
//! loop, which owns a [`workqueue::WorkQueue`], a [`data::DataStore`], a
//! [`dependency::DependencyEngine`], and the [`sync::SyncEngine`] handshake
//! that every server-to-server interaction funnels through.
//! [`messaging::Transport`] abstracts the network; [`transport::ChannelTransport`]
//! is the in-memory test double used in place of MPI.
//!
//! # Architecture
//!
//! - **Layout**: frozen worker/server rank partition and host grouping
//! - **Data store**: single-assignment datums, refcounting, containers
//! - **Work queue**: priority/target-aware task scheduling with work stealing
//! - **Dependency engine**: `dput` wait-sets released onto the ready-work array
//! - **Sync engine**: the sole server-to-server handshake, deadlock-free by
//!   construction via a strict rank-ordered accept/defer rule

#![warn(missing_docs)]
#![warn(unused_crate_dependencies)]

pub mod backoff;
pub mod client;
pub mod config;
pub mod data;
pub mod dependency;
pub mod error;
pub mod layout;
pub mod messaging;
pub mod notify;
pub mod requestqueue;
pub mod server;
pub mod steal;
pub mod sync;
pub mod transport;
pub mod workqueue;

pub use client::{ClientContext, ClientOp, ClientReply};
pub use config::Config;
pub use data::{DataStore, DatumType};
pub use error::{AdlbError, Result};
pub use layout::{HostId, Layout, Rank};
pub use messaging::{Tag, Transport};
pub use server::ServerContext;
pub use sync::SyncEngine;
pub use transport::{ChannelMesh, ChannelTransport};
