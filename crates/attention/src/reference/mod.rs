//! Reference dense-softmax attention backend.
//!
//! This path prioritises fidelity over memory: the full similarity matrix is
//! materialised, which is what makes masking, injection and probability
//! observation possible.

mod dense;

pub use dense::DenseAttention;
