//! Integration test support for the buslane runtime.
//!
//! The tests live in `tests/`; this crate body only exists so the package
//! builds as a workspace member.
