//! On-disk mirror management.
//!
//! A request path resolves to a namespace ([`namespace`]), which maps to a
//! mirror directory and key ([`path`]).  Work on one mirror is serialised by
//! [`locks`], and [`materializer`] brings the mirror up to date with the refs
//! a request needs ([`refspec`]).

pub mod locks;
pub mod materializer;
pub mod namespace;
pub mod path;
pub mod refspec;

pub use locks::MirrorLockRegistry;
pub use materializer::{Materializer, MaterializerLimits, Ready};
pub use namespace::NamespaceResolver;
pub use path::{MirrorLocation, MirrorPathMapper};
pub use refspec::RefSpec;
