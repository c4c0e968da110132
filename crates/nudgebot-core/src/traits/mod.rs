//! Collaborator seams. Concrete transports and content generators live outside this core.

pub mod gateway;
pub mod responder;

pub use gateway::Gateway;
pub use responder::Responder;
