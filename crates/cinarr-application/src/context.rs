// SPDX-License-Identifier: GPL-3.0-or-later
//! Collaborators shared by the queues, the verifier and the maintenance jobs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use cinarr_config::AppConfig;
use cinarr_infrastructure::repositories::Repositories;
use cinarr_infrastructure::state_files::StateDir;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::debrid::DebridProvider;
use crate::events::{
    EventPublisher, InMemoryEventBus, LoggingNotifier, NoopPostProcessing, Notifier,
    PostProcessingHook,
};
use crate::media_server::{FilesystemLibrary, MediaServer};
use crate::metadata::{MetadataProvider, UnconfiguredMetadata};
use crate::scrapers::ScraperManager;
use crate::search_automation::ScrapeService;

#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<AppConfig>,
    pub repos: Repositories,
    pub scrape: Arc<ScrapeService>,
    pub debrid: Arc<dyn DebridProvider>,
    pub metadata: Arc<dyn MetadataProvider>,
    pub media_server: Arc<dyn MediaServer>,
    pub state: Arc<StateDir>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<dyn EventPublisher>,
    pub notifier: Arc<dyn Notifier>,
    pub post_processing: Arc<dyn PostProcessingHook>,
}

impl PipelineContext {
    pub fn builder(
        config: AppConfig,
        repos: Repositories,
        state: StateDir,
        scrapers: ScraperManager,
        debrid: Arc<dyn DebridProvider>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            config,
            repos,
            state,
            scrapers,
            debrid,
            metadata: Arc::new(UnconfiguredMetadata),
            media_server: Arc::new(FilesystemLibrary),
            clock: Arc::new(SystemClock),
            events: Arc::new(InMemoryEventBus::new()),
            notifier: Arc::new(LoggingNotifier),
            post_processing: Arc::new(NoopPostProcessing),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Required collaborators up front, the rest defaulted and overridable.
pub struct PipelineBuilder {
    config: AppConfig,
    repos: Repositories,
    state: StateDir,
    scrapers: ScraperManager,
    debrid: Arc<dyn DebridProvider>,
    metadata: Arc<dyn MetadataProvider>,
    media_server: Arc<dyn MediaServer>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventPublisher>,
    notifier: Arc<dyn Notifier>,
    post_processing: Arc<dyn PostProcessingHook>,
}

impl PipelineBuilder {
    pub fn metadata(mut self, metadata: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn media_server(mut self, media_server: Arc<dyn MediaServer>) -> Self {
        self.media_server = media_server;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn post_processing(mut self, hook: Arc<dyn PostProcessingHook>) -> Self {
        self.post_processing = hook;
        self
    }

    pub fn build(self) -> PipelineContext {
        let config = Arc::new(self.config);
        let scrape = ScrapeService::new(
            Arc::clone(&config),
            self.scrapers,
            Arc::clone(&self.metadata),
            self.repos.aliases.clone(),
            self.repos.not_wanted.clone(),
        );
        info!(target: "application", "pipeline context initialized");
        PipelineContext {
            config,
            repos: self.repos,
            scrape: Arc::new(scrape),
            debrid: self.debrid,
            metadata: self.metadata,
            media_server: self.media_server,
            state: Arc::new(self.state),
            clock: self.clock,
            events: self.events,
            notifier: self.notifier,
            post_processing: self.post_processing,
        }
    }
}
