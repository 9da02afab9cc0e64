pub mod admission;
pub mod auth;
pub mod cli;
pub mod config;
pub mod convert;
pub mod cookies;
pub mod downloader;
pub mod error;
pub mod filters;
pub mod fingerprint;
pub mod fname;
pub mod host;
pub mod hsts;
pub mod job;
pub mod logging;
pub mod metalink;
pub mod network;
pub mod parsers;
pub mod plugin;
pub mod rcfile;
pub mod response;
pub mod sink;
pub mod stats;
pub mod url_utils;

// Re-export the types embedders need for driving the engine directly.
pub use config::Config;
pub use downloader::{run, Engine};
pub use error::{ExitCode, ExitStatus, GrabError};
pub use fingerprint::FingerprintSet;
pub use host::{HostKey, HostRegistry, NextJob, RobotsPolicy};
pub use job::{Job, Part, PartSet};
pub use metalink::Metalink;
pub use stats::{Stats, StatsSnapshot};
