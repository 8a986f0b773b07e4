//! Cache-backed client for the document portal.
//!
//! Reads go through a [`cache::QueryCache`]; writes go through a
//! [`mutation::MutationCoordinator`] that updates the cache optimistically and
//! rolls it back when the server refuses. [`poller::StatusPoller`] follows
//! documents while the server processes them.

pub mod cache;
pub mod config;
pub mod logging;
pub mod mutation;
pub mod poller;
pub mod portal;

#[cfg(test)]
pub(crate) mod testing;
