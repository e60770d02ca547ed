pub mod job;
pub mod queues;
pub mod states;
pub mod tube;
