use netsat_model::NodeName;

#[derive(Debug, thiserror::Error)]
pub enum CompilerError {
    #[error("node {0} already exists (use --force to overwrite)")]
    Conflict(NodeName),

    #[error("a live link between {0} and {1} already exists")]
    DuplicateLink(NodeName, NodeName),

    #[error("no existing link record between {0} and {1}")]
    UnknownLink(NodeName, NodeName),

    #[error("endpoint {0} is not a known node")]
    UnknownEndpoint(NodeName),

    #[error("antenna {antenna} is out of range for {node} (has {count})")]
    AntennaOutOfRange { node: NodeName, antenna: u32, count: u32 },

    #[error(transparent)]
    VniExhausted(#[from] crate::vni::VniExhausted),

    #[error("malformed epoch: {0}")]
    MalformedEpoch(String),
}
