//! ecs-hatch: an interactive terminal front end for reaching into running
//! ECS tasks.
//!
//! The operator walks region → cluster → service → task → container and,
//! from the selected container, opens a remote shell, streams or downloads
//! logs, or edits the container's environment and redeploys.

pub mod app;
pub mod aws;
pub mod cache;
pub mod cli;
pub mod config;
pub mod env;
pub mod error;
pub mod event;
pub mod logs;
pub mod model;
pub mod navigation;
pub mod prefetch;
pub mod provider;
pub mod session;
pub mod ui;
