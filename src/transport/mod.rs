//! Framed stdio transport
//!
//! Newline-delimited JSON-RPC over the child's stdin/stdout.

pub mod codec;
pub(crate) mod reader;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;

pub use codec::{parse_line, EnvelopeCodec, MAX_LINE_BYTES};

/// Write half of a child's stdio
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half of a child's stdout or stderr
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Serialized writer shared by every caller; one complete line per lock.
pub(crate) type SharedWriter = Arc<Mutex<FramedWrite<BoxedWriter, EnvelopeCodec>>>;

pub(crate) fn shared_writer(stdin: BoxedWriter) -> SharedWriter {
    Arc::new(Mutex::new(FramedWrite::new(stdin, EnvelopeCodec::new())))
}
