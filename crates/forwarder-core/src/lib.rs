//! Dependency-light primitives shared by the `forwarder` library and the
//! `forwarder-app` binary: a cheap-clone interned string, a byte-counting
//! bidirectional copy helper, a tokio runtime metrics collector, and build
//! metadata. Nothing here knows about HTTP or proxy semantics.

pub mod bow;
pub mod copy;
pub mod strng;
pub mod tokio_metrics;
pub mod version;

pub use strng::Strng;
