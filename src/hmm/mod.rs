//! Heterogeneous memory management: GPU access to ordinary process memory.

pub mod block;
pub mod fault;
pub mod info;
pub mod invalidate;
pub mod migrate;
pub mod page_mask;
pub mod policy;
pub mod space;
