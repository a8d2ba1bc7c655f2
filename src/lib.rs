//! Core of a single-video YouTube downloader: tool provisioning, cookie
//! handling, retries and job orchestration around an external download engine.

pub mod api;
pub mod application;
pub mod config;
pub mod domain;
pub mod logging;
pub mod process;
pub mod utils;
