use episode_convert_core::{ConversionFailure, VerifyError};
use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display(
        "Cannot derive a destination from source {path}. \
         Pass --dest explicitly."
    ))]
    NoDefaultDestination { path: String },

    #[snafu(display("{source}"))]
    Convert {
        #[snafu(source(from(ConversionFailure, Box::new)))]
        source: Box<ConversionFailure>,
    },

    #[snafu(display("Cannot verify {path}: {source}"))]
    Verify {
        path: String,
        #[snafu(source(from(VerifyError, Box::new)))]
        source: Box<VerifyError>,
    },

    #[snafu(display("{path} failed verification with {problems} problem(s)"))]
    Inconsistent { path: String, problems: usize },
}
