//! Tiered sample sizes for document-store schema discovery.

/// Sample size to use when discovering schema for a document collection
/// of `estimated_count` documents. Thresholds: ≤1k full scan, ≤10k sample
/// 1k, ≤100k sample 2k, ≤1M sample 5k, otherwise sample 10k.
pub fn sample_size_for(estimated_count: u64) -> u64 {
    match estimated_count {
        0..=1_000 => estimated_count,
        1_001..=10_000 => 1_000,
        10_001..=100_000 => 2_000,
        100_001..=1_000_000 => 5_000,
        _ => 10_000,
    }
}
