pub mod config;
pub mod error;
pub mod freeflow;
pub mod join;
pub mod normalize;
pub mod pipeline;
pub mod polygons;
pub mod routes;
pub mod scoring;
pub mod segments;
pub mod stats;
pub mod summary;
pub mod table;
pub mod temporal;
pub mod types;
pub mod vanish;
pub mod zones;
