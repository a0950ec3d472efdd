use std::path::PathBuf;

/// The closed set of error kinds from the design's error-handling section.
/// Every variant is a `{kind, numeric_code, human_message}` record once
/// formatted — `numeric_code()` and `Display` give the latter two; the
/// variant itself *is* `kind`.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("no such network: {name}")]
    NoSuchNetwork { name: String },

    #[error("invalid network {name}: {reason}")]
    InvalidNetwork { name: String, reason: String },

    #[error("network name already in use: {name}")]
    NameConflict { name: String },

    #[error("network uuid already in use: {uuid} (held by '{existing_name}')")]
    UuidConflict { uuid: uuid::Uuid, existing_name: String },

    #[error("network '{name}' is already active")]
    AlreadyActive { name: String },

    #[error("network '{name}' is still active")]
    StillActive { name: String },

    #[error("malformed network definition: {reason}")]
    MalformedDefinition { reason: String },

    #[error("bridge name space exhausted (template '{template}')")]
    BridgeExhausted { template: String },

    #[error("bridge '{bridge}' already in use by network '{other_network}'")]
    BridgeInUse { bridge: String, other_network: String },

    #[error("host effector step '{step}' failed for '{name}': {source}")]
    HostEffectorFailed {
        step: String,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to build firewall rules for '{name}': {reason}")]
    FirewallBuildFailed { name: String, reason: String },

    #[error("nwfilter variable '{variable}' unresolved on interface '{ifname}'")]
    FilterVariableUnresolved { ifname: String, variable: String },

    #[error(
        "nwfilter value '{value}' for variable '{variable}' exceeds the {data_type} buffer on interface '{ifname}'"
    )]
    FilterBufferOverflow {
        ifname: String,
        variable: String,
        data_type: String,
        value: String,
    },

    #[error("protocol '{protocol}' is not supported on network interface type '{net_type}'")]
    FilterProtocolUnsupported { protocol: String, net_type: String },

    #[error("io error on {path}: {source}")]
    IoFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl NetworkError {
    /// A stable numeric code, analogous to the design's `numeric_code`
    /// field, kept independent of enum discriminant order so that adding a
    /// variant never renumbers an existing one.
    pub fn numeric_code(&self) -> u32 {
        match self {
            NetworkError::NoSuchNetwork { .. } => 1,
            NetworkError::InvalidNetwork { .. } => 2,
            NetworkError::NameConflict { .. } => 3,
            NetworkError::UuidConflict { .. } => 4,
            NetworkError::AlreadyActive { .. } => 5,
            NetworkError::StillActive { .. } => 6,
            NetworkError::MalformedDefinition { .. } => 7,
            NetworkError::BridgeExhausted { .. } => 8,
            NetworkError::BridgeInUse { .. } => 9,
            NetworkError::HostEffectorFailed { .. } => 10,
            NetworkError::FirewallBuildFailed { .. } => 11,
            NetworkError::FilterVariableUnresolved { .. } => 12,
            NetworkError::FilterBufferOverflow { .. } => 13,
            NetworkError::FilterProtocolUnsupported { .. } => 14,
            NetworkError::IoFailed { .. } => 15,
        }
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;
