pub mod alerts;
pub mod collector;
pub mod db;
pub mod indicators;
pub mod markets;
pub mod monitor;
pub mod routes;
pub mod scheduler;
pub mod server;
pub mod types;
