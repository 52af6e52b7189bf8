pub mod broker;
pub mod channel;
pub mod cli;
pub mod config;
pub mod handler;
pub mod listener;
pub mod logging;
pub mod producer;
pub mod reading;
pub mod shutdown;
pub mod sink;
pub mod source;
pub mod stall;
