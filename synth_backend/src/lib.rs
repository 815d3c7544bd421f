pub mod agent;
pub mod config;
pub mod database;
pub mod embedding;
pub mod llm_client;
pub mod memory;
pub mod runtime;

#[cfg(test)]
mod testing;
