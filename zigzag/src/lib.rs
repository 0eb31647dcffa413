//! Design space exploration of DNN accelerators: for every layer of a workload, finds the
//! spatial and temporal mappings onto an accelerator's memory hierarchy with the lowest
//! energy, latency or EDP, and reports the cost breakdown.

pub mod api;
pub mod common;
pub mod config;
pub mod cost;
pub mod hardware;
pub mod loma;
pub mod mapping;
pub mod pipeline;
pub mod salsa;
pub mod spatial;
pub mod workload;
