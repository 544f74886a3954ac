//! Reconciliation controllers: node lifecycle, pod lifecycle, pod/node
//! binding, and deploy package construction.

pub mod backoff;
pub mod binder;
pub mod dispatch;
pub mod node;
pub mod package;
pub mod pod;
pub mod worker;
