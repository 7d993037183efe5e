//! Automated feature-implementation pipeline.
//!
//! A natural-language feature request is carried through a fixed sequence of
//! phases against an existing codebase: context analysis, intent parsing,
//! impact analysis, code synthesis, execution and an optional sandbox
//! test-repair loop. Every LLM worker call is wrapped in a scope-enforcement
//! interceptor stack so the worker can only touch files the impact analysis
//! allowed. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (scope resolution, interceptor
//!   checks, result normalizers, error classification, report aggregation).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting collaborators behind traits (filesystem,
//!   worker, detector, sandbox, config, artifacts).
//! - **[`agents`]**: Worker-facing components that render a prompt, drive a
//!   bounded conversation and parse the result.
//!
//! Orchestration modules ([`orchestrator`], [`impact`], [`apply`],
//! [`sandbox_loop`]) coordinate core logic with I/O to run a workflow.

pub mod agents;
pub mod apply;
pub mod core;
pub mod exit_codes;
pub mod impact;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod sandbox_loop;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
