// Library exports for driftbottle
// This allows integration tests and the console binary to use the modules

pub mod activity;
pub mod avatar;
pub mod bottles;
pub mod cloud;
pub mod commands;
pub mod config;
pub mod cooling;
pub mod db;
pub mod error;
pub mod media;
pub mod moderation;
pub mod state;
pub mod stats;
