pub mod branch;
pub mod feeder;
pub mod network;
pub mod phasor;
pub mod rnp;
pub mod topology;

pub use branch::*;
pub use feeder::*;
pub use network::*;
pub use phasor::*;
pub use rnp::*;
pub use topology::*;
