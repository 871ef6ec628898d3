pub mod attachments;
pub mod cache;
pub mod correlation;
pub mod direction;
pub mod log;
pub mod mapper;
pub mod orchestrator;
pub mod planner;
pub mod transform;
