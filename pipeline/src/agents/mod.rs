//! LLM-facing agents: each renders a prompt, drives the worker and parses
//! its output.

pub mod intent;
pub mod interceptor;
pub mod repair;
pub mod synthesis;
