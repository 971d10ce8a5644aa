pub mod approval;
pub mod operation;
pub mod policy;
pub mod token;
