//! Pattern discovery: URL generalization, normalization, and validation.

pub mod normalizer;
pub mod synthesize;
pub mod validate;

pub use normalizer::{BridgeNormalizer, NormalizeRequest, NormalizedGroup, PatternNormalizer};
pub use synthesize::synthesize;
pub use validate::{discover_source, DiscoveryStats, SourceDiscovery};
