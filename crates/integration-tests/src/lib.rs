//! Integration tests for cstor-chunked.
//!
//! Each test builds layer blobs in memory, serves them through a recording
//! [`BlobSource`](cstor_chunked::BlobSource) and applies them into a
//! temporary layer store. Tests register themselves through linkme so new
//! files only need a `mod` line.

#![allow(unsafe_code)] // Required for linkme

use libtest_mimic::{Arguments, Trial};
use linkme::distributed_slice;

pub mod fixture;
mod tests;

/// Every registered test, filled in by [`integration_test!`].
#[distributed_slice]
pub static INTEGRATION_TESTS: [fn() -> Trial];

/// Run the registered tests with libtest-compatible arguments.
pub fn run_tests() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let args = Arguments::from_args();
    let tests: Vec<Trial> = INTEGRATION_TESTS.iter().map(|f| f()).collect();
    libtest_mimic::run(&args, tests).exit();
}

/// Register a test.
///
/// ```ignore
/// use integration_tests::{integration_test, fixture::TestLayerStore};
///
/// integration_test!(test_store_starts_empty, || {
///     let store = TestLayerStore::new()?;
///     assert!(store.layers()?.is_empty());
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! integration_test {
    ($name:ident, $body:expr) => {
        $crate::paste::paste! {
            #[$crate::linkme::distributed_slice($crate::INTEGRATION_TESTS)]
            #[linkme(crate = $crate::linkme)]
            fn [<__register_ $name>]() -> $crate::libtest_mimic::Trial {
                $crate::libtest_mimic::Trial::test(
                    stringify!($name),
                    move || {
                        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = $body();
                        result.map_err(|e| $crate::libtest_mimic::Failed::from(e.to_string()))
                    },
                )
            }
        }
    };
}

// Re-export for use in macro
pub use libtest_mimic;
pub use linkme;
pub use paste;
