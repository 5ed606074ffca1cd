//! The batch migration engine and the pieces it is built from.
pub mod cache;
pub mod embed;
pub mod ids;
pub mod ledger;
pub mod model;
pub mod pipeline;
pub mod result;
pub mod transform;
pub mod writer;
