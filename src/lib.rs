pub mod collaborators;
pub mod config;
pub mod detect;
pub mod errors;
pub mod gate;
pub mod handoff;
pub mod lock;
pub mod router;
pub mod safety;
pub mod session;
pub mod surface;
