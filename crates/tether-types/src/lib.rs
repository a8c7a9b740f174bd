//! Core types for the Tether peer-to-peer service framework.
//!
//! This crate defines the data model shared by the wire protocol, the kernel
//! and the CLI: identities, service addresses, descriptors, entities, the
//! binary codec they are encoded with, and the error taxonomy. It performs no
//! I/O.

pub mod codec;
pub mod config;
pub mod descriptor;
pub mod entity;
pub mod error;
pub mod identity;
pub mod service;
