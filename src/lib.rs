#![forbid(unsafe_code)]

pub mod archive;
pub mod cache;
pub mod cli;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod epub;
pub mod fingerprint;
pub mod formats;
pub mod logging;
pub mod marker;
pub mod progress;
pub mod source;
pub mod sync;
