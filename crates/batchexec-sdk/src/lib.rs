// batchexec-sdk: foundation layer for the batch change execution engine.
// This crate has ZERO dependencies on sibling crates and provides the core
// process-control, tracing, and filesystem utilities used throughout the
// engine.

pub mod build_constants;
pub mod io_util;
pub mod process_invoker;
pub mod trace;

// Re-export commonly used items at crate root
pub use build_constants::EngineVersion;
pub use io_util::IOUtil;
pub use process_invoker::{ProcessDataReceivedEventArgs, ProcessExitCodeError, ProcessInvoker};
pub use trace::TraceWriter;
