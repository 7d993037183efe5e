//! Stable exit codes for the pipeline CLI.

use crate::core::types::Verdict;

/// Feature implemented and verified in the sandbox, or a non-run command succeeded.
pub const VERIFIED: i32 = 0;
/// Invalid invocation, config or codebase root.
pub const INVALID: i32 = 1;
/// Patches applied but not verified in a sandbox.
pub const UNVERIFIED: i32 = 2;
/// A critical phase failed or the workflow was cancelled.
pub const NOT_IMPLEMENTED: i32 = 3;

pub fn for_verdict(verdict: Verdict) -> i32 {
    match verdict {
        Verdict::ImplementedAndVerified => VERIFIED,
        Verdict::ImplementedUnverified => UNVERIFIED,
        Verdict::NotImplemented => NOT_IMPLEMENTED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdicts_map_to_distinct_codes() {
        assert_eq!(for_verdict(Verdict::ImplementedAndVerified), VERIFIED);
        assert_eq!(for_verdict(Verdict::ImplementedUnverified), UNVERIFIED);
        assert_eq!(for_verdict(Verdict::NotImplemented), NOT_IMPLEMENTED);
        assert_ne!(INVALID, UNVERIFIED);
    }
}
