pub mod activity;
pub mod buffer;
pub mod config;
pub mod daily;
pub mod db;
pub mod flusher;
pub mod leveling;
pub mod session;
pub mod util;
