use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::lot::JobKind;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

// The events the qualification workflow can emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Lifecycle events
    LotCreated(Uuid),
    CriteriaConfigured {
        lot_id: Uuid,
        form_type: String,
        criterion: String,
    },
    StepAdvanced {
        lot_id: Uuid,
        from_step: u8,
        to_step: u8,
    },
    LotRolledBack {
        lot_id: Uuid,
        from_step: u8,
        to_step: u8,
    },
    LotRetried {
        lot_id: Uuid,
        step: u8,
    },
    LotExported(Uuid),

    // Extraction sub-job events
    ExtractionStarted(Uuid),
    ExtractionCompleted {
        lot_id: Uuid,
        product_rows: usize,
        material_rows: usize,
        bom_rows: usize,
    },
    ExtractionFailed {
        lot_id: Uuid,
        job: JobKind,
        message: String,
    },

    // Calculation events
    ConsumptionCalculated {
        lot_id: Uuid,
        record_count: usize,
        shortage_count: usize,
    },
    StockShortageDetected {
        lot_id: Uuid,
        material_code: String,
        required: Decimal,
        available: Decimal,
    },
    OriginEvaluated {
        lot_id: Uuid,
        sku_code: String,
        criterion: String,
        qualified: bool,
        percentage: Decimal,
    },
    CalculationFailed {
        lot_id: Uuid,
        message: String,
    },

    // Report sub-job events
    ReportGenerationStarted(Uuid),
    ReportsGenerated {
        lot_id: Uuid,
        report_count: usize,
    },
    ReportGenerationFailed {
        lot_id: Uuid,
        message: String,
    },

    // Generic event for custom messages
    Generic {
        message: String,
        timestamp: DateTime<Utc>,
        metadata: serde_json::Value,
    },
}

impl Event {
    /// Create a generic event with string data
    pub fn with_data(data: String) -> Self {
        Event::Generic {
            message: data,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }
}

// Trait for handling events. Handlers implementing this trait process events asynchronously.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: Event) -> Result<(), String>;
}

// Consumes the event channel and logs every event; the default sink when no
// dedicated handler is registered.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::StockShortageDetected {
                lot_id,
                ref material_code,
                required,
                available,
            } => {
                warn!(
                    %lot_id,
                    material_code,
                    %required,
                    %available,
                    "stock shortage detected"
                );
            }
            Event::ExtractionFailed {
                lot_id,
                job,
                ref message,
            } => {
                error!(%lot_id, %job, message, "extraction sub-job failed");
            }
            Event::CalculationFailed { lot_id, ref message } => {
                error!(%lot_id, message, "calculation failed");
            }
            Event::ReportGenerationFailed { lot_id, ref message } => {
                error!(%lot_id, message, "report generation failed");
            }
            Event::OriginEvaluated {
                lot_id,
                ref sku_code,
                ref criterion,
                qualified,
                percentage,
            } => {
                info!(
                    %lot_id,
                    sku_code,
                    criterion,
                    qualified,
                    %percentage,
                    "origin criterion evaluated"
                );
            }
            other => {
                info!(event = ?other, "event processed");
            }
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (tx, mut rx) = mpsc::channel(8);
        let sender = EventSender::new(tx);
        let lot_id = Uuid::new_v4();
        sender.send(Event::LotCreated(lot_id)).await.unwrap();
        match rx.recv().await {
            Some(Event::LotCreated(id)) => assert_eq!(id, lot_id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_fails_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        let err = sender.send(Event::LotCreated(Uuid::new_v4())).await;
        assert!(err.is_err());
    }
}
