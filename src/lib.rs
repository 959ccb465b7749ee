// Public API - configuration, data types and the probing pipeline
pub mod config;
pub mod error;
pub mod export;
pub mod lpm;
pub mod probe;
pub mod state;
pub mod trace;
