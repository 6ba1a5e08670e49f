pub mod adapters;
pub mod config;
pub mod dunning;
pub mod error;
pub mod frequency;
pub mod lifecycle;
pub mod materializer;
pub mod merchants;
pub mod models;
pub mod subscriptions;
pub mod synchronizer;

pub use error::{EngineError, EngineResult};
pub use frequency::{add_frequency, next_due, Frequency, FrequencyUnit};
pub use subscriptions::{SubscriptionService, SyncOptions};
pub use synchronizer::{DeliverySchedule, PreliminaryOrder, SyncItem, SyncPlan};
