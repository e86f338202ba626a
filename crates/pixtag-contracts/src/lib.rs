//! Data types and pure decision logic for the pixtag metadata pipeline:
//! prompt templates, response recovery, file records and progress events.

pub mod events;
pub mod normalize;
pub mod records;
pub mod templates;
