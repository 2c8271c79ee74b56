//! KF Assist: automated storefront chat replies.
//!
//! Decides, for each inbound customer message, whether to answer from the
//! address rule, the knowledge base or a generative model, and which media
//! to attach. Each message is handled once and one decision cycle runs at a
//! time.

pub mod channels;
pub mod clock;
pub mod config;
pub mod error;
pub mod journal;
pub mod knowledge;
pub mod llm;
pub mod pipeline;
pub mod store;
