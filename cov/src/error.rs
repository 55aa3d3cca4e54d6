use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("shared memory name {0:?} contains a NUL byte")]
    InvalidName(String),
    #[error("{operation} on {name:?} failed: {source}")]
    Shm {
        operation: &'static str,
        name: String,
        source: std::io::Error,
    },
    #[error("anonymous mapping failed: {0}")]
    AnonymousMapping(std::io::Error),
    #[error("target reported no coverage instrumentation")]
    NoInstrumentation,
    #[error("target reported {num_edges} edges, limit is {limit}")]
    TooManyEdges { num_edges: u32, limit: usize },
    #[error("coverage map was not initialized yet")]
    NotInitialized,
}

pub type Result<T> = core::result::Result<T, CoverageError>;
