//! Runtime support for Tether: the retry executor used to make connection
//! setup resilient to transient network failure.

pub mod retry;
