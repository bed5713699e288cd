//! Workspace root crate.
//!
//! Exists to host the end-to-end integration suites under
//! `tests/integration/`; all functionality lives in `arena-protocol` and the
//! `server` service crate.
