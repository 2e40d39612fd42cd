//! Runtime invariant checks with contract-test support.
//!
//! Production code states its invariants with [`assert_invariant!`]. Tests can
//! then assert, through [`contract_test`], that a code path actually exercised
//! the checks it is supposed to guard.
//!
//! Checks run on tokio worker threads, so the record of which invariants were
//! evaluated is process-wide rather than per thread.
//!
//! ```rust,ignore
//! assert_invariant!(
//!     state.frames.len() <= self.capacity,
//!     "frame buffer never exceeds capacity",
//!     "buffer"
//! );
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

lazy_static::lazy_static! {
    static ref CHECKED: Mutex<HashMap<String, u64>> = Mutex::new(HashMap::new());
}

/// Assert an invariant and record that it was evaluated.
///
/// # Panics
/// Panics if the condition is false.
#[macro_export]
macro_rules! assert_invariant {
    ($condition:expr, $message:expr) => {
        $crate::invariant_ppt::__check_invariant($condition, $message, None)
    };
    ($condition:expr, $message:expr, $context:expr) => {
        $crate::invariant_ppt::__check_invariant($condition, $message, Some($context))
    };
}

#[doc(hidden)]
pub fn __check_invariant(condition: bool, message: &str, context: Option<&str>) {
    if cfg!(debug_assertions) {
        let mut checked = CHECKED.lock().unwrap_or_else(PoisonError::into_inner);
        *checked.entry(message.to_string()).or_insert(0) += 1;
    }

    if !condition {
        let ctx = context.unwrap_or("unknown");
        log::error!("invariant violated [{}]: {}", ctx, message);
        panic!("INVARIANT VIOLATION [{}]: {}", ctx, message);
    }
}

/// How many times an invariant has been evaluated (debug builds only).
pub fn times_checked(message: &str) -> u64 {
    CHECKED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(message)
        .copied()
        .unwrap_or(0)
}

/// Fail unless every listed invariant was evaluated at least once.
///
/// # Panics
/// Panics listing the invariants that were never checked.
pub fn contract_test(test_name: &str, required_invariants: &[&str]) {
    let missing: Vec<&str> = required_invariants
        .iter()
        .copied()
        .filter(|invariant| times_checked(invariant) == 0)
        .collect();

    if !missing.is_empty() {
        panic!(
            "CONTRACT FAILURE [{}]: never checked:\n  - {}",
            test_name,
            missing.join("\n  - ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checks_are_recorded() {
        crate::assert_invariant!(true, "invariant_ppt self check", "tests");
        assert!(times_checked("invariant_ppt self check") >= 1);
        contract_test("self", &["invariant_ppt self check"]);
    }

    #[test]
    #[should_panic(expected = "INVARIANT VIOLATION [tests]")]
    fn test_violation_panics() {
        crate::assert_invariant!(1 + 1 == 3, "arithmetic holds", "tests");
    }

    #[test]
    #[should_panic(expected = "CONTRACT FAILURE")]
    fn test_missing_contract() {
        contract_test("missing", &["an invariant nobody checks"]);
    }
}
