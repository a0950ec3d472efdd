//! Trait-shaped host effectors (spec §6). Core logic is written against
//! these traits; the `Ip*`/`Cli*`/`Std*` implementations in this crate are
//! the reference Linux backend the daemon binary wires up by default.

pub mod bridge;
pub mod firewall;
pub mod fs;
pub mod proc;

pub use bridge::{BridgeEffector, IpRouteBridgeEffector};
pub use firewall::{CliFirewallEffector, FirewallEffector};
pub use fs::{FsEffector, StdFsEffector, autostart_link_target};
pub use proc::{ProcEffector, StdProcEffector};
