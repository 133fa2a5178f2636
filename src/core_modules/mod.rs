pub mod accelerator;
pub mod histogram;
pub mod notification;
pub mod numeric;
pub mod region;
pub mod shared_buffer;
pub mod tracker;
pub mod transfer;
pub mod weight_engine;
