//! Coordination core of the support knowledge desk: quiet-period dialog
//! aggregation, short-lived pending interactions, and retried sync of new
//! knowledge records to an external sheet.

pub mod aggregator;
pub mod collab;
mod config;
pub mod desk;
pub mod error;
pub mod format;
pub mod mailbox;
pub mod memory;
pub mod pending;
pub mod pipeline;
pub mod retry;
pub mod router;
pub mod sync;
pub mod tasks;
pub mod types;

pub use aggregator::{DialogHandler, FlushReport, QuietPeriodAggregator};
pub use collab::{
    AnalysisService, AnswerOptions, CategoryInsert, DurableStore, ExternalSink, Reply,
    SharedAnalysis, SharedSink, SharedStore, SharedTransport, Transport,
};
pub use config::{
    load_config, load_effective_config, parse_operator_list, AccessConfig, AggregatorConfig,
    AnalysisConfig, CategoriesConfig, Config, PendingConfig, SearchConfig, StoreConfig,
    SyncConfig,
};
pub use desk::InteractionDesk;
pub use error::{ServiceError, ServiceResult};
pub use mailbox::KeyedDispatcher;
pub use memory::InMemoryStore;
pub use pending::{Decision, PendingMode, PendingStore};
pub use pipeline::DialogPipeline;
pub use retry::{RetryExhausted, RetryPolicy};
pub use router::{Event, EventKind, Router};
pub use sync::{SyncCoordinator, SyncOutcome};
pub use types::{
    BufferedMessage, Category, Classification, CompletedDialog, ConversationKey, KnowledgeMatch,
    KnowledgeRecord, NewKnowledgeRecord, RecordPatch, SenderRole, StoreStats,
};
