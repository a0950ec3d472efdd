pub mod compiler;

pub use compiler::{InterfaceType, RuleInstance, compile};
