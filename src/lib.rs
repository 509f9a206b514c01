pub mod config;
pub mod context;
pub mod dispatch;
pub mod document;
pub mod error;
pub mod invoker;
pub mod notify;
pub mod orchestrator;
pub mod outcome;
pub mod persist;
pub mod poller;
pub mod progress;
pub mod synthesis;
