//! # CBAM Intake Core
//!
//! Runtime-free logic for the CBAM intake pipeline: data models, header
//! unification, row normalization, the material classifier, the feedback
//! store, and the port traits the application crate implements.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or network access.
//! Every port has an in-memory implementation so the whole pipeline can be
//! exercised without external services.
//!
//! | Module | Role |
//! |--------|------|
//! | [`header`] | raw column names → canonical columns |
//! | [`normalize`] | raw values → typed canonical cells |
//! | [`classify`] | material text → controlled label |
//! | [`corpus`] | training corpus and atomic snapshots |
//! | [`feedback`] | user corrections → corpus updates |
//! | [`store`] | persistence port for normalized records |
//! | [`source`] | row-source port and request shape |
//! | [`embedding`] | embedding port and cosine similarity |

pub mod classify;
pub mod corpus;
pub mod embedding;
pub mod feedback;
pub mod header;
pub mod models;
pub mod normalize;
pub mod source;
pub mod store;
