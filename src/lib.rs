pub mod baker;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod experiment;
pub mod queue;
pub mod shutdown;
pub mod store;
pub mod worker;
