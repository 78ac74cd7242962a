pub mod app;
pub mod browser;
pub mod canonical;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod fs_util;
pub mod geometry;
pub mod kml;
pub mod loader;
pub mod output;
pub mod query;
pub mod store;
