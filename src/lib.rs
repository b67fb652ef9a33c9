//! Multi-process SMTP receiving server with Maildir delivery.
//!
//! The master process owns the one listening socket and hands each
//! accepted connection's file descriptor to one of a pool of worker
//! processes over a `SCM_RIGHTS` control channel; a dedicated logger
//! process is the sole writer of the log file. Every connection inside
//! a worker is driven by the [`context::Context`] state machine
//! through to a `QUIT`, a protocol error, or a timeout.

pub mod buffer;
pub mod command;
pub mod context;
pub mod error;
pub mod fdpass;
pub mod fsm;
pub mod logger;
pub mod maildir;
pub mod master;
pub mod reply;
pub mod settings;
pub mod signals;
pub mod transaction;
pub mod worker;
