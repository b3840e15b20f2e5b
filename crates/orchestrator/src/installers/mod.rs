pub mod script;

pub use script::{ScriptHooks, ScriptInstaller};
