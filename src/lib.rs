pub mod bot;
pub mod commands;
pub mod config;
pub mod conversation;
pub mod error;
pub mod ledger;
pub mod payment;
pub mod provisioning;
pub mod store;
pub mod sweeper;
pub mod transport;
