pub mod config;
pub mod errors;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod server;
pub mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;
