pub mod actions;
pub mod agent;
pub mod backoff;
pub mod certs;
pub mod channel;
pub mod cli;
pub mod config;
pub mod descriptor;
pub mod diagnostics;
pub mod enrollment;
pub mod error;
pub mod http;
pub mod logging;
pub mod packager;
pub mod queue;
pub mod registry;
pub mod reload;
pub mod sample;
pub mod scheduler;
pub mod sender;
pub mod sensor;
pub mod spool;
