pub mod hitl;
pub mod policy;
pub mod rate_limit;
pub mod rbac;
