//! Reconciles the execution metadata of a finished pipeline run against a
//! remote metadata catalog: builds a provenance graph of tasks and file
//! artifacts, resolves derivation lineage, and submits new output files as
//! catalog records exactly once.

pub mod catalog;
pub mod content;
pub mod domain;
pub mod engine;
pub mod error;
pub mod graph;
pub mod lineage;
pub mod metadata;
pub mod qc;
pub mod steps;
