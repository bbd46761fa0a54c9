pub mod dispatcher;
pub mod queues;
