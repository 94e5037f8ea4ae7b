// Ingest module: typed consumers for the upstream topics, the event model
// and the shared dead-letter path.

pub mod consumers;
pub mod dead_letter;
pub mod events;

pub use consumers::{
    expected_kinds_for_topic, EventIngestor, InMemoryTopic, InMemoryTopicProducer, IngestMetrics,
    TopicRecord, TopicSource,
};
pub use dead_letter::{
    AlertSeverity, DeadLetterHandler, DeadLetterMetrics, LogAlerter, OperatorAlert,
    OperatorAlerter,
};
pub use events::{decode_event, EventKind, EventRouter, UpstreamEvent};
