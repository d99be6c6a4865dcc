pub mod analyzer;
pub mod app;
pub mod cache;
pub mod command;
pub mod config;
pub mod domain;
pub mod error;
pub mod http;
pub mod kv;
pub mod output;
pub mod pipeline;
pub mod sources;
pub mod store;
pub mod strategy;
pub mod table;
