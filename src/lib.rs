pub mod application;
pub mod chunking;
pub mod db;
pub mod embedder;
pub mod fts;
pub mod indexer;
pub mod reader;
pub mod relations;
pub mod repo;
pub mod retrieval;
