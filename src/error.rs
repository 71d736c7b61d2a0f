/// Error returned from [crate::Fit] construction and solver runs
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FitError {
    #[error("no foreground or background model attached")]
    NoModelAttached,

    #[error("{context}: expected shape {expected:?}, found {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("encountered NaN in {0}")]
    NanEncountered(&'static str),

    #[error("no range declared for parameter {0:?}")]
    MissingParameterRange(String),

    #[error("solver failed: {0}")]
    SolverFailed(String),
}

impl FitError {
    pub(crate) fn shape_mismatch<E, A>(context: &'static str, expected: E, actual: A) -> Self
    where
        E: AsRef<[usize]>,
        A: AsRef<[usize]>,
    {
        Self::ShapeMismatch {
            context,
            expected: expected.as_ref().to_vec(),
            actual: actual.as_ref().to_vec(),
        }
    }
}
