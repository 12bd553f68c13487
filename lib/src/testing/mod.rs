//! Test harness shared by the SHFS crates.
//!
//! Test functions return [`TestResult`] instead of panicking so that a
//! failure can be logged with context and counted without unwinding.
//! Suites are declared with [`define_test_suite!`], which emits a suite
//! runner plus per-test `#[cfg(test)]` shims so every suite also runs
//! under `cargo test` on the host.

mod assertions;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestResult {
    Pass,
    Fail,
}

impl TestResult {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail)
    }
}

/// Aggregated result of one suite run.
#[derive(Clone, Copy, Debug)]
pub struct SuiteOutcome {
    pub name: &'static str,
    pub passed: u32,
    pub total: u32,
}

impl SuiteOutcome {
    #[inline]
    pub fn failed(&self) -> u32 {
        self.total.saturating_sub(self.passed)
    }

    #[inline]
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

/// Run one test function, logging its name and outcome.
pub fn run_single_test(name: &str, test: impl FnOnce() -> TestResult) -> TestResult {
    crate::log_debug!("TEST: {}", name);
    let result = test();
    if result.is_failure() {
        crate::log_info!("TEST FAIL: {}", name);
    }
    result
}

#[macro_export]
macro_rules! pass {
    () => {
        $crate::testing::TestResult::Pass
    };
}

#[macro_export]
macro_rules! fail {
    () => {
        $crate::testing::TestResult::Fail
    };
    ($msg:expr) => {{
        $crate::log_info!("TEST FAIL: {}", $msg);
        $crate::testing::TestResult::Fail
    }};
    ($fmt:expr, $($arg:tt)*) => {{
        $crate::log_info!(concat!("TEST FAIL: ", $fmt), $($arg)*);
        $crate::testing::TestResult::Fail
    }};
}

#[macro_export]
macro_rules! run_test {
    ($passed:expr, $total:expr, $test_fn:expr) => {{
        $total += 1;
        let result = $crate::testing::run_single_test(stringify!($test_fn), || $test_fn());
        if result.is_pass() {
            $passed += 1;
        }
        result
    }};

    ($test_fn:expr) => {{ $crate::testing::run_single_test(stringify!($test_fn), || $test_fn()) }};
}

/// Declare a test suite from a list of `fn() -> TestResult` items.
///
/// Emits `run_<suite>_suite()` returning a [`SuiteOutcome`], and a
/// `#[cfg(test)]` module with one `#[test]` shim per listed function.
#[macro_export]
macro_rules! define_test_suite {
    ($suite_name:ident, [$($test_fn:ident),* $(,)?]) => {
        $crate::paste::paste! {
            pub fn [<run_ $suite_name _suite>]() -> $crate::testing::SuiteOutcome {
                let mut passed = 0u32;
                let mut total = 0u32;

                $(
                    $crate::run_test!(passed, total, $test_fn);
                )*

                $crate::testing::SuiteOutcome {
                    name: stringify!($suite_name),
                    passed,
                    total,
                }
            }

            #[cfg(test)]
            mod [<$suite_name _suite_host>] {
                $(
                    #[test]
                    fn $test_fn() {
                        assert!(super::$test_fn().is_pass());
                    }
                )*
            }
        }
    };
}
