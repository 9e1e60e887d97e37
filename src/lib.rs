pub mod cli;
pub mod config;
pub mod error;
pub mod ledger;
pub mod models;
pub mod ports;
pub mod probe;
pub mod report;
pub mod scheduler;
pub mod supervisor;
pub mod template;
