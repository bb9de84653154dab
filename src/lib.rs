//! Builds labelled intrusion-detection datasets by reconstructing flows from
//! packet captures and joining them with HTTP request logs.
//!
//! The two stages are independent: [`capture`] turns capture files into flow
//! tables (CSV), and [`merge`] pairs each logged request with the flow that
//! most plausibly carried it, derives NSL-KDD style features and labels the
//! result by source address.

pub mod capture;
pub mod config;
pub mod error;
pub mod features;
pub mod flow;
pub mod flow_csv;
pub mod index;
pub mod l7;
pub mod label;
pub mod matcher;
pub mod merge;
pub mod packet;
pub mod queue;
pub mod timestamp;

pub use error::{DecodeError, Result, SleuthError};
pub use flow::{FlowAggregate, FlowKey, FlowTable};
pub use index::FlowIndex;
pub use label::{Label, Labeler};
pub use matcher::Matcher;
pub use packet::Packet;
