//! Log attach and broadcast pipeline
//!
//! Workload output is read line by line ([`attach`]), stamped into
//! [`LogRecord`](crate::models::LogRecord)s and sent both to the external
//! forwarder ([`forwarder`]) and to the [`LogBroadcaster`], which serves live
//! subscribers over chunk-framed streams ([`framing`], [`server`]).

pub mod attach;
pub mod broadcaster;
pub mod forwarder;
pub mod framing;
pub mod server;


pub use attach::{LogAttacher, LogSink, RecordMeta};
pub use broadcaster::LogBroadcaster;
pub use forwarder::{LogTarget, LogWriter, LogWriterConfig, LogWriterError};
pub use framing::encode_chunk;
