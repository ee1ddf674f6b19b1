pub mod agent;
pub mod channel;
pub mod config;
pub mod entity;
pub mod error;
pub mod kv;
pub mod packet;
pub mod stage;
pub mod store;
pub mod sync;
pub mod trace;
pub mod worker;

pub use error::{Error, Result};
