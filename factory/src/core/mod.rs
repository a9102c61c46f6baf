//! Deterministic, pure logic shared by the controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod budget;
pub mod cancel;
pub mod checks;
pub mod ci;
pub mod feedback;
pub mod naming;
pub mod state;
pub mod types;
