//! Domain classification
//!
//! Decides, per domain name, whether traffic should be carried through the
//! tunnel, resolved directly, or refused outright. Rule documents use the
//! gfwlist dialect; see [`matcher`] for the grammar.
//!
//! The live classifier is a lock-free snapshot ([`engine::Classifier`])
//! rebuilt from the configured sources ([`source`]) at startup and on
//! demand.

pub mod engine;
pub mod matcher;
pub mod source;

pub use engine::{Classifier, ClassifierSnapshot};
pub use matcher::{Rule, RuleKind, RuleSet};
pub use source::build_snapshot;
