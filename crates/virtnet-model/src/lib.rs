pub mod error;
pub mod network;
pub mod nwfilter;

pub use error::{NetworkError, Result};
pub use network::{DerivedNetwork, DhcpHost, DhcpRange, ForwardMode, NetworkDef, is_bridge_name_template};
pub use nwfilter::{
    Action, Backend, DataType, Direction, EntryDescriptor, EntryValue, ProtocolType, ResolvedEntry, ResolvedRule,
    RuleDef, VariableTable, resolve_rule,
};
