//! Configuration shared by both attention engines.

use layers::SimilarityPrecision;

use super::errors::AttentionError;

/// Static configuration of one attention engine instance.
///
/// `inner_dim` is the working attention width and must equal
/// `heads * dim_head`; it is independent of `query_dim`, which the output
/// projection restores.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Channel width of the query input (and of the engine output).
    pub query_dim: usize,
    /// Channel width of the context input; `None` means self-attention
    /// shape, i.e. `query_dim`.
    pub context_dim: Option<usize>,
    /// Number of parallel attention heads.
    pub heads: usize,
    /// Channel width of a single head.
    pub dim_head: usize,
    /// Working attention width, `heads * dim_head`.
    pub inner_dim: usize,
    /// Training-time dropout rate on the output projection. Recorded for
    /// training integrations; engine forwards run in eval mode and never
    /// sample, so inference stays deterministic.
    pub dropout_p: Option<f32>,
    /// Upcast policy for the similarity-score matmul.
    pub precision: SimilarityPrecision,
}

impl EngineConfig {
    /// Creates a configuration with `inner_dim` derived from the head
    /// geometry.
    pub fn new(query_dim: usize, heads: usize, dim_head: usize) -> Self {
        Self {
            query_dim,
            context_dim: None,
            heads,
            dim_head,
            inner_dim: heads * dim_head,
            dropout_p: None,
            precision: SimilarityPrecision::default(),
        }
    }

    /// Context width resolved against the self-attention fallback.
    pub fn context_dim_or_query(&self) -> usize {
        self.context_dim.unwrap_or(self.query_dim)
    }

    /// Validates the head geometry. Violating configurations must fail at
    /// engine construction, never silently truncate.
    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.heads == 0 || self.dim_head == 0 {
            return Err(AttentionError::shape(format!(
                "heads ({}) and dim_head ({}) must be non-zero",
                self.heads, self.dim_head
            )));
        }
        if self.inner_dim != self.heads * self.dim_head {
            return Err(AttentionError::shape(format!(
                "inner_dim ({}) must equal heads * dim_head ({} * {})",
                self.inner_dim, self.heads, self.dim_head
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_inner_dim_validates() {
        let config = EngineConfig::new(320, 8, 40);
        assert_eq!(config.inner_dim, 320);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn mismatched_inner_dim_is_rejected() {
        let mut config = EngineConfig::new(320, 8, 40);
        config.inner_dim = 256;
        assert!(matches!(
            config.validate(),
            Err(AttentionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn zero_heads_are_rejected() {
        let config = EngineConfig::new(64, 0, 64);
        assert!(config.validate().is_err());
    }

    #[test]
    fn configs_compare_by_value() {
        let mut a = EngineConfig::new(64, 2, 32);
        let b = a.clone();
        assert_eq!(a, b);
        a.dropout_p = Some(0.1);
        assert_ne!(a, b);
    }

    #[test]
    fn context_dim_falls_back_to_query_dim() {
        let mut config = EngineConfig::new(64, 2, 32);
        assert_eq!(config.context_dim_or_query(), 64);
        config.context_dim = Some(768);
        assert_eq!(config.context_dim_or_query(), 768);
    }
}
