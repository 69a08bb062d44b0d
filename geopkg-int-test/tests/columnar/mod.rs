//! Arrow batch export tests covering every export strategy.

mod cancel_test;
mod ffi_test;
mod prefetch_test;
mod strategy_test;
