//! Core library for the cryomag acquisition system.
//!
//! A sweep of magnet field, signal generator and lock-in settings is stored by
//! the central server and measured one step at a time by two coordinators, a
//! cryogenics station and a magnetism station. They exchange [`protocol`]
//! events over a [`transport`]; the [`server`] sequences steps and routes
//! events by client role, the [`coordinator`]s drive the [`station`]s through
//! a [`queue`], and results land in [`storage`].

pub mod config;
pub mod coordinator;
pub mod error;
pub mod error_recovery;
pub mod experiment;
pub mod instrument;
pub mod logging;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod station;
pub mod storage;
pub mod transport;
