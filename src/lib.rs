//! Origin API Library
//!
//! Certificate-of-origin qualification engine: takes an export lot through
//! the seven-step workflow (upload, criteria setup, extraction, calculation,
//! report generation, review, export), allocates raw-material consumption
//! FIFO against inventory receipts, and evaluates the configured
//! rule-of-origin criterion per SKU.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod entities;
pub mod errors;
pub mod events;
pub mod repositories;
pub mod services;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::events::{Event, EventSender};
use crate::repositories::Repositories;
use crate::services::extraction::{ReportRenderer, TableExtractor};
use crate::services::workflow::WorkflowService;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub config: config::AppConfig,
    pub event_sender: Arc<EventSender>,
    pub repositories: Repositories,
    pub workflow: Arc<WorkflowService>,
}

impl AppState {
    /// Wires the in-memory backend with the given extraction and rendering
    /// seams. Returns the state plus the receiving end of the event channel;
    /// the caller decides how to drain it (usually
    /// [`events::process_events`]).
    pub fn new(
        config: config::AppConfig,
        extractor: Arc<dyn TableExtractor>,
        renderer: Arc<dyn ReportRenderer>,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(config.event_channel_capacity);
        let event_sender = Arc::new(EventSender::new(tx));
        let repositories = Repositories::in_memory();
        let workflow = Arc::new(WorkflowService::new(
            repositories.clone(),
            event_sender.clone(),
            extractor,
            renderer,
            &config,
        ));
        (
            Self {
                config,
                event_sender,
                repositories,
                workflow,
            },
            rx,
        )
    }

    pub fn workflow_service(&self) -> Arc<WorkflowService> {
        self.workflow.clone()
    }
}

pub mod prelude {
    pub use crate::config::{AllocationSettings, AppConfig, OriginSettings};
    pub use crate::entities::*;
    pub use crate::errors::*;
    pub use crate::events::*;
    pub use crate::repositories::*;
    pub use crate::services::*;
    pub use crate::AppState;
}
