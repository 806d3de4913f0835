//! Log Analyst: durable, batched ingestion of log events with LLM analysis.

pub mod broker;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod store;
