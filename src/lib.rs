#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]

pub mod actor;
pub mod backoff;
pub mod delay_queue;
pub mod error;
pub mod message;
pub mod processor;
pub mod source;

pub use actor::{Actor, ActorBuilder, FailureHandler};
pub use backoff::{Backoff, ConstantBackoff, ExponentialBackoff};
pub use delay_queue::{DelayQueue, InMemoryDelayQueue, Visit};
pub use error::{BoxError, ProcessError, ReadError, RunError};
pub use message::Message;
pub use processor::{NoopProcessor, Processor};
pub use source::{LineSource, Source, StreamSource};
