mod app;
pub mod config;
pub mod devnet;
pub mod metrics;
pub mod network;
pub mod runner;
pub mod store;
pub mod sync;
pub mod validator;

// for main.rs
pub use app::run;
