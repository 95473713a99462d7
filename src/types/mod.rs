//! Core types: identifiers, field masks, region requirements, provenance.

pub mod dependence;
pub mod field_mask;
pub mod id;
pub mod provenance;

pub use dependence::{
    compute_dependence_type, CoherenceMode, DependenceType, PrivilegeMode, RegionRequirement,
    RegionUsage,
};
pub use field_mask::FieldMask;
pub use id::{
    AddressSpaceId, DistributedId, FieldId, FieldSpace, GenerationId, IndexPartition, IndexSpace,
    LogicalRegion, OpId, UniqueOpId,
};
pub use provenance::{PackedProvenance, Provenance};
