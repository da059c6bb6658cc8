//! Data Transfer Objects for REST request/response serialization.

pub mod topic_dto;

pub use topic_dto::*;
