//! Subsystem logging helpers.
//!
//! Every subsystem attaches its tag by entering a span from here;
//! downstream events inherit the `subsystem` field. With no subscriber
//! installed all of this is a no-op, which is the default — the crate
//! never installs one itself.

use tracing::Span;

pub const SUBSYS_REPLICATION: &str = "repl";
pub const SUBSYS_RPC: &str = "rpc";
pub const SUBSYS_ENDPOINT: &str = "endpoint";
pub const SUBSYS_PRUNING: &str = "pruning";
pub const SUBSYS_SNAPSHOT: &str = "snapshot";
pub const SUBSYS_SERVE: &str = "serve";

/// Span tagging all events below it with a subsystem.
pub fn subsystem_span(subsystem: &'static str) -> Span {
    tracing::info_span!("subsystem", subsystem = subsystem)
}

/// Span for one pruner run; `prune_side` is `"sender"` or `"receiver"`.
pub fn pruner_span(prune_side: &'static str) -> Span {
    tracing::info_span!(
        "pruning",
        subsystem = SUBSYS_PRUNING,
        prune_side = prune_side
    )
}
