//! Host device information helpers. Currently limited to parsing the
//! kernel mount table, which is the authoritative source of truth for
//! what is mounted where on a node.

pub mod mountinfo;
