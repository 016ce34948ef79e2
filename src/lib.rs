//! Media stream aggregator core: fan-out search across ~20 heterogeneous
//! providers, normalize/dedup/rank the results, and lazily resolve preview
//! streams to playable urls on click. The HTTP routing layer lives outside
//! this crate and binds [Aggregator], [resolver::Resolver] and
//! [usenet::UsenetController].

pub mod aggregate;
pub mod availability;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod filtering;
pub mod logging;
pub mod metadata;
pub mod model;
pub mod query;
pub mod resolver;
pub mod scrapers;
pub mod token;
pub mod usenet;

pub use aggregate::{AggregateOutcome, Aggregator};
pub use config::Config;
pub use error::{Error, Result};
pub use logging::init_tracer;
pub use model::{ContentType, MediaRequest, StreamItem};
pub use resolver::{Resolved, Resolver};
pub use usenet::{Download, DownloadStatus, UsenetController};
