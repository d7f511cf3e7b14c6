pub mod app;
pub mod auth;
pub mod checkpoint;
pub mod cmr;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod links;
pub mod output;
pub mod query;
