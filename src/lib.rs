pub mod config;
pub mod currency;
pub mod error;
pub mod expense;
pub mod notification;
pub mod policy;
pub mod service;
pub mod stats;
pub mod store;
pub mod user;
pub mod utils;
pub mod workflow;
