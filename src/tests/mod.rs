//! Cross-module test suites: end-to-end task lifecycle scenarios and
//! system invariants.
