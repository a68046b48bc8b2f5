pub mod activity;
pub mod api;
pub mod audit;
pub mod bridge;
pub mod broker;
pub mod buffer;
pub mod config;
pub mod envfile;
pub mod health;
pub mod orchestrator;
pub mod protocol;
pub mod pty;
pub mod session;
pub mod shell;
pub mod shutdown;
