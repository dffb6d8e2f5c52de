pub mod engine;
pub mod harness;
pub mod logging;
pub mod options;
