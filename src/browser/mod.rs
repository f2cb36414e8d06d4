//! Local Chrome process launching. Out of scope for the core engine (the
//! engine only ever speaks to an already-running remote debugging endpoint)
//! but kept as a CLI convenience for attaching without a separately-started
//! browser.

pub mod launcher;
