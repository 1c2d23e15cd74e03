pub mod app;
pub mod catalog;
pub mod config;
pub mod credentials;
pub mod domain;
pub mod dwi;
pub mod error;
pub mod extract;
pub mod fs_util;
pub mod layout;
pub mod output;
pub mod pipeline;
pub mod reconcile;
