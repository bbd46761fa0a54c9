pub mod codec;
pub mod envelope;
pub mod forward;
