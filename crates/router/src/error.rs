use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Unknown cluster: {0}")]
    UnknownCluster(String),

    #[error("Cluster {0} has no hosts")]
    NoHosts(String),

    #[error("No healthy host in cluster {0}")]
    NoHealthyHost(String),
}

pub type Result<T> = std::result::Result<T, RouterError>;
