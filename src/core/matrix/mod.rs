pub mod envelope;
pub mod ghost;

pub use envelope::{DeviceLists, Events, MAX_PDU_AGE_MS};
