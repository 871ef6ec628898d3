pub mod issue;
pub mod mapping;
pub mod operation;
