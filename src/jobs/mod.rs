pub mod approvals;
pub mod flush;
