pub mod scripted;
pub mod session;

pub use scripted::{Script, ScriptedEndpoint};
pub use session::TestSession;
