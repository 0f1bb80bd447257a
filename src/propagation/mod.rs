//! Transaction propagation.
//!
//! A decorated call declares how it relates to the transaction already in
//! scope. [`Propagator`] reads the ambient frame, asks [`decide`] what to
//! do, and runs the body inside a new frame; queries built in that body
//! resolve against the frame when they are awaited.

pub mod ambient;
mod dispatch;
mod error;
mod interceptor;

pub use ambient::{current_frame, current_scope_key, with_scope, AmbientFrame, BoundTransaction};
pub use dispatch::{decide, Decision};
pub use error::{PropagationError, PropagationResult, UsageError, UsageResult};
pub use interceptor::{InterceptorRegistry, MethodTarget, Propagator, Transactional};
