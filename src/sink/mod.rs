//! Vector stream sink boundary: the abstract consumer of a typed vector
//! stream, plus the concrete AVC text sink.
//!
//! Concrete sinks own a file (or, for the simulation driver in
//! [`crate::sim`], a running DUT) and implement [`VectorSink`]. A sink's
//! `open`/`close` pair gives it scoped-acquisition lifecycle: the header is
//! committed on open, the body is appended vector-by-vector, so the output
//! stays well-formed even if generation aborts partway through.

pub mod avc;

use thiserror::Error;

use crate::vector::Vector;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to {action} {path}: {cause}")]
    Io {
        action: String,
        path: String,
        #[source]
        cause: std::io::Error,
    },

    #[error("parse error at line {line}: {reason}")]
    ParseError { line: usize, reason: String },
}

/// Abstract consumer of a typed vector stream. `open` commits whatever
/// header/companion files the sink needs; `write_vectors` appends a batch,
/// optionally compressing it first; `close` releases the underlying
/// resource.
pub trait VectorSink {
    fn open(&mut self) -> Result<(), SinkError>;
    fn write_vectors(&mut self, vectors: &[Vector], compress: bool) -> Result<(), SinkError>;
    fn close(&mut self) -> Result<(), SinkError>;
}
