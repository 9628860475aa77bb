//! Street aggregation, clustering engines and the partitioning pipeline.

pub mod assignment;
pub mod constrained;
pub mod duplication;
pub mod kmeans;
pub mod length;
pub mod streets;
pub mod territory;
pub mod warnings;
pub mod weighted;

// Re-export key types for convenience
pub use assignment::{
    cluster_stats, propagate, AnnotatedAddress, AssignmentError, ClusterAssignment, ClusterStats, ClusterTotals,
};
pub use constrained::{balanced_spatial_clustering, ConstrainedError, ConstrainedOutcome, ConstrainedParams};
pub use duplication::{replicate, ReplicatedPoints, SizeBounds};
pub use length::{estimate_street_length, LengthEstimate, StreetKind};
pub use streets::{aggregate_streets, ClusteredStreet, StreetAggregation, StreetError, StreetSummary};
pub use territory::{
    partition, process_address_file, write_partition, OutputFiles, PartitionRequest, PartitionResult, TerritoryError,
};
pub use warnings::PipelineWarning;
pub use weighted::{weighted_spatial_clustering, WeightedError, WeightedOutcome, WeightedParams};
