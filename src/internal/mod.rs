//! Building blocks shared by both halves of a pipe.

pub(crate) mod once;
pub(crate) mod sync;
