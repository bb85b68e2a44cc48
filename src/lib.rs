pub mod audit;
pub mod bus;
pub mod configuration;
pub mod deps;
pub mod domain;
pub mod events;
pub mod idempotency;
pub mod notifier;
pub mod object_store;
pub mod outbox;
pub mod payer_client;
pub mod pipeline;
pub mod routes;
pub mod stages;
pub mod startup;
pub mod sync_path;
pub mod telemetry;
pub mod tracker;
pub mod utils;
pub mod worker;

#[cfg(test)]
pub mod test_support;
