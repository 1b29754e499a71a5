//! Farm-wide synchronisation of in-process caches through a shared instruction log.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
