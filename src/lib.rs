pub mod application;
pub mod config;
pub mod domain;
pub mod framework;
pub mod infrastructure;
pub mod messaging;
