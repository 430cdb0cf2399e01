//! Cross-cutting glue shared by the binaries.

pub mod logging;
