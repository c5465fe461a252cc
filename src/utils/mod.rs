pub mod net;
pub mod path;
pub mod sos;
