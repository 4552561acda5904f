//! Concurrent load generation and latency measurement against a text
//! processing service.

pub mod config;
pub mod error;
pub mod harness;
pub mod outcome;
pub mod poller;
pub mod recorder;
pub mod rendezvous;
pub mod report;
pub mod source;
pub mod stats;
pub mod target;
pub mod worker;

pub use config::*;
pub use error::{CoordinationError, HarnessError, RequestError, Result};
pub use harness::*;
pub use outcome::*;
pub use poller::*;
pub use recorder::*;
pub use rendezvous::*;
pub use report::*;
pub use source::*;
pub use stats::*;
pub use target::*;
pub use worker::*;
