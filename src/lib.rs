pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod events;
pub mod executor;
pub mod jump;
pub mod logging;
pub mod plan;
pub mod quality;
pub mod server;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;
