//! Graph backend: an embedded property graph plus the adapter mapping
//! tuples onto vertices and associations onto labeled edges.

pub mod database;
mod dialect;
pub mod index;

pub use database::{Edge, EdgeId, GraphDatabase, GraphState, GraphTransaction, VertexId};
pub use dialect::GraphStore;
pub use index::{IndexManager, GRAPH_RESERVED_WORDS};
