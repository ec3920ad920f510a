//! Index price command line consumer
//!
//! Reads the aggregated bar stream and writes it out for humans or tools.

pub mod output;
pub mod shutdown;

pub use output::{write_bar, write_header, OutputFormat};
pub use shutdown::wait_for_signal;
