use thiserror::Error;

/// Largest init image edge the out-of-memory hint recommends.
pub const MAX_INIT_IMAGE_DIMENSION: u32 = 768;

const STARTING_UP_MESSAGE: &str = "Stable Diffusion is still starting up, please wait. \
If this goes on beyond a few minutes, Stable Diffusion has probably crashed. \
Please check the error message in the command-line window.";

/// Errors returned while talking to a Stable Diffusion UI server.
///
/// The `Display` output of every variant is the user-facing status message.
#[derive(Error, Debug)]
pub enum SdError {
    /// The request could not be sent or the response stream broke off.
    #[error("Stable Diffusion had an error. Please check the logs in the command-line window.\n\n{context}: {source}")]
    Network {
        context: String,
        source: reqwest::Error,
    },

    /// Non-200 response while the server was known to be online.
    #[error("Stable Diffusion had an error: {body}")]
    Server { status: u16, body: String },

    /// Non-200 response while the server was not yet known to be online.
    #[error("{}", STARTING_UP_MESSAGE)]
    StartingUp { status: u16 },

    /// The final payload reported a status other than `succeeded`.
    #[error("{0}")]
    GenerationFailed(String),

    /// The final payload could not be interpreted.
    #[error("Invalid response from Stable Diffusion: {0}")]
    InvalidResponse(String),

    /// The request timed out.
    #[error("Request to Stable Diffusion timed out")]
    Timeout,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SdError {
    /// Build a [`SdError::GenerationFailed`] from the server's detail text,
    /// appending remediation steps when the server ran out of memory.
    pub fn generation_failed(detail: impl Into<String>) -> Self {
        let mut msg = detail.into();
        if msg.to_lowercase().contains("out of memory") {
            msg.push_str(&out_of_memory_suggestions());
        }
        SdError::GenerationFailed(msg)
    }

    /// Wrap a transport error, mapping reqwest timeouts to [`SdError::Timeout`].
    pub(crate) fn network(context: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return SdError::Timeout;
        }
        SdError::Network {
            context: context.into(),
            source,
        }
    }
}

fn out_of_memory_suggestions() -> String {
    format!(
        "\n\nSuggestions:\n\
         1. If you have set an initial image, please try reducing its dimension to {d}x{d} or smaller.\n\
         2. Try disabling the 'Turbo mode' under 'Advanced Settings'.\n\
         3. Try generating a smaller image.",
        d = MAX_INIT_IMAGE_DIMENSION
    )
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, SdError>;
