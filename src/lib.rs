//! Exec Assist: inbox triage and meeting scheduling for a busy executive.

pub mod calendar;
pub mod config;
pub mod error;
pub mod inbox;
pub mod llm;
pub mod mail;
pub mod pipeline;
pub mod store;
pub mod summary;
pub mod web;
