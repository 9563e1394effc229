//! Range lifecycle flows: one module per top-level operation,
//! each a thin, independently testable layer over [`super::state`]'s pure
//! transition table plus the side effects the operation performs through
//! [`super::safe::safe_execute`].

pub mod create;
pub mod destroy;
pub mod remove;
