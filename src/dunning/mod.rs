pub mod classify;
pub mod scheduler;
pub mod service;

pub use classify::{classify, ChargeClass};
pub use scheduler::{process_tick as run_billing_sweep_tick, spawn as spawn_billing_scheduler};
pub use service::{retry_permitted, run_daily_billing, DailyBillingReport};
