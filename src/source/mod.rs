//! Wire formats spoken by the ingest pipeline.

pub mod bits;
pub mod directip;
pub mod fm100;
