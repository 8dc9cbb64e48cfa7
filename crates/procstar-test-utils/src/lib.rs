//! Test doubles shared by the procstar server's integration tests.

pub mod mock_agent;

pub use mock_agent::{AgentIdentity, MockAgent};
