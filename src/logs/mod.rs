// Logs module - Output capture and rotation

mod capture;
mod writer;

pub use capture::{strip_escape_codes, CapturedLine, OutputCapture, OutputStream};
pub use writer::{EchoSink, LogSink, LogWriter, OutputSink};
