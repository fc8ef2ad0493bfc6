pub mod correlator;
pub mod queue;
