pub mod auth;
pub mod config;
pub mod graph;
pub mod output;
pub mod processor;
pub mod subscription;
pub mod webhook;
