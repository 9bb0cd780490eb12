pub mod app;
pub mod classifier;
pub mod cluster;
pub mod config;
pub mod domain;
pub mod error;
pub mod normalize;
pub mod output;
pub mod request;
pub mod review;
pub mod store;
pub mod tui;
