// SPDX-License-Identifier: GPL-3.0-or-later
pub mod clock;
pub mod connectivity;
pub mod content_sources;
pub mod context;
pub mod debrid;
pub mod events;
pub mod filtering;
pub mod library_verifier;
pub mod maintenance;
pub mod matcher;
pub mod media_server;
pub mod metadata;
pub mod queues;
pub mod ranking;
pub mod reconciler;
pub mod release_parsing;
pub mod scrapers;
pub mod search_automation;
pub mod title_similarity;

#[cfg(test)]
mod test_support;

pub use clock::{Clock, ManualClock, SystemClock};
pub use connectivity::{ConnectivityError, ConnectivityProbe, HttpConnectivityProbe, ProbeTarget};
pub use content_sources::{ContentSource, ContentSourceDriver, ContentSourceError, SourceRunReport};
pub use context::{PipelineBuilder, PipelineContext};
pub use debrid::{DebridError, DebridProvider, RealDebridClient};
pub use events::{EventPublisher, InMemoryEventBus, Notifier, PostProcessingHook};
pub use library_verifier::{LibraryVerifier, Verification};
pub use maintenance::Maintenance;
pub use media_server::{FilesystemLibrary, MediaServer, MediaServerError};
pub use metadata::{MetadataError, MetadataProvider, UnconfiguredMetadata};
pub use queues::{NoopControl, ProcessReport, QueueError, QueueManager, QueueName, SchedulerControl};
pub use reconciler::{ReconcileReport, Reconciler};
pub use release_parsing::{parse_release_title, ParseError, ParsedInfo};
pub use scrapers::{HttpJsonScraper, RawResult, ScrapeQuery, ScraperBackend, ScraperError, ScraperManager};
pub use search_automation::{ScrapeOutcome, ScrapeService};
